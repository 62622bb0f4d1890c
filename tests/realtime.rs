use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use maze_quest_server::config::GameRules;
use maze_quest_server::maze::Maze;
use maze_quest_server::questions::{Question, QuestionBank};
use maze_quest_server::registry::{RegistryOptions, SessionRegistry};
use maze_quest_server::rng::Rng;
use maze_quest_server::server::{build_router, AppState};
use maze_quest_server::session::GameSession;
use maze_quest_server::types::{Difficulty, Direction, GameStateView};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (SocketAddr, Arc<SessionRegistry>) {
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(QuestionBank::builtin().unwrap()),
        RegistryOptions::default(),
    ));
    let app = build_router(AppState::new(Arc::clone(&registry)), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr, id: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws?id={id}")).await.unwrap();
    client
}

async fn recv(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn recv_json(client: &mut Client) -> Value {
    match recv(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn blocked_direction(state: &GameStateView) -> Direction {
    let pos = state.player.current_pos;
    Direction::ALL
        .into_iter()
        .find(|dir| {
            state
                .board
                .cell(pos.step(*dir))
                .map(|cell| !cell.cell_type.is_open() && !cell.is_question_wall)
                .unwrap_or(true)
        })
        .unwrap()
}

fn corridor_session(id: &str, lives: u32) -> GameSession {
    let bank = QuestionBank::new(vec![Question::new(
        1,
        "2+2?",
        vec!["3".to_string(), "4".to_string()],
        "4",
        Difficulty::Easy,
    )])
    .unwrap();
    let maze = Maze::from_tiles(&["#######", "#S.Q.E#", "#######"]).unwrap();
    let rules = GameRules {
        starting_lives: lives,
        ..GameRules::default()
    };
    GameSession::new(id.to_string(), maze, Arc::new(bank), rules, Rng::new(7))
}

#[tokio::test]
async fn answers_and_exit_reach_every_client() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.insert(corridor_session("game_corridor", 3)).await;
    let mut player = connect(addr, handle.id()).await;
    let mut watcher = connect(addr, handle.id()).await;
    recv_json(&mut player).await;
    recv_json(&mut watcher).await;

    let right = json!({ "type": "move", "direction": "RIGHT" });
    send_json(&mut player, right.clone()).await;
    send_json(&mut player, right.clone()).await;
    send_json(&mut player, json!({ "type": "answer", "question_id": 1, "answer": "4" })).await;
    for _ in 0..3 {
        send_json(&mut player, right.clone()).await;
    }

    for client in [&mut player, &mut watcher] {
        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(recv_json(client).await["payload"].clone());
        }
        let names: Vec<&str> = results
            .iter()
            .map(|payload| payload["result"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["Moved", "QuestionWallHit", "Correct", "Moved", "Moved", "Win"]
        );

        let correct = &results[2];
        assert_eq!(correct["correct"], true);
        assert_eq!(correct["opened_wall"], json!({ "x": 3, "y": 1 }));
        assert_eq!(correct["player"]["score"], 10);
        assert_eq!(correct["status"], "ACTIVE");

        let win = &results[5];
        assert_eq!(win["seq"], 6);
        assert_eq!(win["status"], "WON");
        let final_state: GameStateView =
            serde_json::from_value(win["game_state"].clone()).unwrap();
        assert_eq!(final_state.id, "game_corridor");
        assert_eq!(final_state.player.score, 10);
        assert_eq!(final_state.opened_walls.len(), 1);
    }
}

#[tokio::test]
async fn losing_the_last_life_broadcasts_the_final_state() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.insert(corridor_session("game_doomed", 1)).await;
    let mut client = connect(addr, handle.id()).await;
    recv_json(&mut client).await;

    let right = json!({ "type": "move", "direction": "RIGHT" });
    send_json(&mut client, right.clone()).await;
    send_json(&mut client, right).await;
    recv_json(&mut client).await;
    let hit = recv_json(&mut client).await;
    assert_eq!(hit["payload"]["result"], "QuestionWallHit");

    send_json(&mut client, json!({ "type": "answer", "question_id": 1, "answer": "3" })).await;
    let update = recv_json(&mut client).await;
    let payload = &update["payload"];
    assert_eq!(payload["result"], "Incorrect");
    assert_eq!(payload["correct"], false);
    assert_eq!(payload["status"], "LOST");
    assert_eq!(payload["player"]["lives"], 0);
    assert_eq!(payload["game_state"]["status"], "LOST");
    assert_eq!(payload["game_state"]["id"], "game_doomed");
}

#[tokio::test]
async fn attached_clients_share_one_ordered_update_stream() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.create(9, 9).await.unwrap();
    let (_, state) = handle.snapshot().await;
    let dir = blocked_direction(&state);

    let mut first = connect(addr, handle.id()).await;
    let mut second = connect(addr, handle.id()).await;
    for client in [&mut first, &mut second] {
        let greeting = recv_json(client).await;
        assert_eq!(greeting["type"], "update");
        assert_eq!(greeting["payload"]["result"], "Sync");
        assert_eq!(greeting["payload"]["seq"], 0);
        let snapshot: GameStateView =
            serde_json::from_value(greeting["payload"]["game_state"].clone()).unwrap();
        assert_eq!(snapshot.player, state.player);
    }

    send_json(&mut first, json!({ "type": "move", "direction": dir })).await;
    send_json(&mut second, json!({ "type": "move", "direction": dir })).await;

    for client in [&mut first, &mut second] {
        for expected in 1..=2 {
            let update = recv_json(client).await;
            assert_eq!(update["payload"]["seq"], expected);
            assert_eq!(update["payload"]["result"], "Blocked");
            assert_eq!(
                update["payload"]["player"]["current_pos"],
                json!({ "x": state.player.current_pos.x, "y": state.player.current_pos.y })
            );
        }
    }
}

#[tokio::test]
async fn errors_and_pongs_go_only_to_the_sender() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.create(9, 9).await.unwrap();
    let (_, state) = handle.snapshot().await;
    let dir = blocked_direction(&state);

    let mut first = connect(addr, handle.id()).await;
    let mut second = connect(addr, handle.id()).await;
    recv_json(&mut first).await;
    recv_json(&mut second).await;

    send_json(&mut first, json!({ "type": "teleport" })).await;
    let error = recv_json(&mut first).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "MALFORMED_MESSAGE");

    send_json(&mut first, json!({ "type": "ping", "t": 7.25 })).await;
    let pong = recv_json(&mut first).await;
    assert_eq!(pong, json!({ "type": "pong", "payload": { "t": 7.25 } }));

    // The next thing the second client sees is the move, not the error or the pong.
    send_json(&mut second, json!({ "type": "move", "direction": dir })).await;
    let update = recv_json(&mut second).await;
    assert_eq!(update["type"], "update");
    assert_eq!(update["payload"]["seq"], 1);
}

#[tokio::test]
async fn sync_request_returns_a_full_snapshot() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.create(7, 7).await.unwrap();
    let mut client = connect(addr, handle.id()).await;
    recv_json(&mut client).await;

    send_json(&mut client, json!({ "type": "sync" })).await;
    let sync = recv_json(&mut client).await;
    assert_eq!(sync["payload"]["result"], "Sync");
    assert_eq!(sync["payload"]["game_state"]["id"], handle.id());
    assert_eq!(sync["payload"]["game_state"]["board"]["rows"], 7);
}

#[tokio::test]
async fn unknown_session_is_refused_before_upgrade() {
    let (addr, _registry) = spawn_server().await;
    let result = connect_async(format!("ws://{addr}/ws?id=game_missing")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn removed_session_closes_the_channel_on_next_message() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.create(7, 7).await.unwrap();
    let mut client = connect(addr, handle.id()).await;
    recv_json(&mut client).await;

    registry.remove(handle.id()).await;
    send_json(&mut client, json!({ "type": "move", "direction": "UP" })).await;

    let error = recv_json(&mut client).await;
    assert_eq!(error["payload"]["code"], "NOT_FOUND");
    match recv(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4404),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_a_connection_detaches_without_touching_the_session() {
    let (addr, registry) = spawn_server().await;
    let handle = registry.create(7, 7).await.unwrap();
    let (_, before) = handle.snapshot().await;

    let mut client = connect(addr, handle.id()).await;
    recv_json(&mut client).await;
    assert_eq!(handle.attached_channels(), 1);
    client.close(None).await.unwrap();

    for _ in 0..50 {
        if handle.attached_channels() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.attached_channels(), 0);
    assert!(registry.get(handle.id()).await.is_ok());
    assert_eq!(handle.snapshot().await.1, before);
}
