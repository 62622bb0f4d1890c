//! One realtime connection bound to one session.
//!
//! Inbound text is parsed and applied through the session handle. Updates
//! reach every attached channel, the sender included, through the session's
//! broadcast, so all channels observe the same order. Errors are only ever
//! written back to the connection that caused them.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use crate::constants::OUTBOUND_QUEUE;
use crate::error::GameError;
use crate::protocol::{
    parse_client_message, ClientMessage, PongPayload, ServerMessage, UpdatePayload,
};
use crate::registry::{Attachment, SessionHandle, SessionRegistry};

pub const SESSION_GONE_CLOSE_CODE: u16 = 4404;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct RealtimeChannel {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
    events: broadcast::Receiver<Arc<UpdatePayload>>,
    last_seq: u64,
    needs_resync: bool,
    _attachment: Attachment,
}

impl RealtimeChannel {
    pub async fn attach(
        registry: Arc<SessionRegistry>,
        session_id: &str,
    ) -> Result<(Self, Outbound), GameError> {
        let handle = registry.get(session_id).await?;
        // Subscribe before the snapshot so nothing between the two is lost.
        let events = handle.subscribe();
        let attachment = handle.attach();
        let (seq, snapshot) = handle.snapshot().await;
        tracing::info!(
            session_id,
            attached = handle.attached_channels(),
            "realtime channel attached"
        );

        let channel = Self {
            registry,
            handle,
            events,
            last_seq: seq,
            needs_resync: false,
            _attachment: attachment,
        };
        let greeting = update_text(&UpdatePayload::sync(seq, snapshot));
        Ok((channel, greeting))
    }

    pub fn session_id(&self) -> &str {
        self.handle.id()
    }

    pub async fn handle_text(&mut self, raw: &str) -> Vec<Outbound> {
        let message = match parse_client_message(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(session_id = %self.session_id(), %err, "rejected inbound message");
                return vec![error_text(&err)];
            }
        };

        if let ClientMessage::Ping { t } = message {
            return vec![Outbound::Text(ServerMessage::Pong(PongPayload { t }).encode())];
        }

        let handle = match self.registry.get(self.handle.id()).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::info!(session_id = %self.session_id(), "session gone; closing channel");
                return vec![
                    error_text(&err),
                    Outbound::Close {
                        code: SESSION_GONE_CLOSE_CODE,
                        reason: "session not found".to_string(),
                    },
                ];
            }
        };

        let result = match message {
            ClientMessage::Move { direction } => handle.apply_move(direction).await.map(|_| None),
            ClientMessage::Answer {
                question_id,
                answer,
            } => handle.answer(question_id, &answer).await.map(|_| None),
            ClientMessage::Sync => Ok(Some(self.resync().await)),
            ClientMessage::Ping { .. } => Ok(None),
        };

        match result {
            Ok(reply) => reply.into_iter().collect(),
            Err(err) => {
                tracing::debug!(session_id = %self.session_id(), %err, "operation rejected");
                vec![error_text(&err)]
            }
        }
    }

    /// Waits for the next update that this connection has not seen yet.
    ///
    /// Returns `None` once the session's event stream is gone. Safe to use as
    /// a `select!` branch: a resync interrupted by cancellation is retried on
    /// the next call.
    pub async fn next_event(&mut self) -> Option<Outbound> {
        loop {
            if self.needs_resync {
                return Some(self.resync().await);
            }
            match self.events.recv().await {
                Ok(update) if update.seq <= self.last_seq => continue,
                Ok(update) => {
                    self.last_seq = update.seq;
                    return Some(update_text(&update));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = %self.session_id(),
                        skipped,
                        "channel lagged; resyncing"
                    );
                    self.needs_resync = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    async fn resync(&mut self) -> Outbound {
        let (seq, snapshot) = self.handle.snapshot().await;
        self.last_seq = seq;
        self.needs_resync = false;
        update_text(&UpdatePayload::sync(seq, snapshot))
    }
}

fn update_text(update: &UpdatePayload) -> Outbound {
    Outbound::Text(ServerMessage::Update(update).encode())
}

fn error_text(error: &GameError) -> Outbound {
    Outbound::Text(ServerMessage::error(error).encode())
}

pub async fn serve_socket(mut channel: RealtimeChannel, greeting: Outbound, socket: WebSocket) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, Outbound::Close { .. });
            let result = match outbound {
                Outbound::Text(payload) => ws_sender.send(Message::Text(payload.into())).await,
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    let mut open = enqueue(&tx, vec![greeting]);
    while open {
        tokio::select! {
            received = ws_receiver.next() => {
                let Some(Ok(message)) = received else {
                    break;
                };
                let replies = match message {
                    Message::Text(raw) => channel.handle_text(raw.as_str()).await,
                    Message::Binary(raw) => match std::str::from_utf8(&raw) {
                        Ok(text) => channel.handle_text(text).await,
                        Err(_) => vec![error_text(&GameError::malformed("invalid utf8 message"))],
                    },
                    Message::Close(_) => break,
                    _ => continue,
                };
                open = enqueue(&tx, replies);
            }
            event = channel.next_event() => {
                let Some(outbound) = event else {
                    break;
                };
                open = enqueue(&tx, vec![outbound]);
            }
        }
    }

    tracing::info!(session_id = %channel.session_id(), "realtime channel detached");
    drop(channel);
    drop(tx);
    let _ = writer.await;
}

/// Queues messages for the writer. `false` means the connection should stop:
/// either a close was queued or the client is not draining its queue.
fn enqueue(tx: &mpsc::Sender<Outbound>, messages: Vec<Outbound>) -> bool {
    for outbound in messages {
        let closing = matches!(outbound, Outbound::Close { .. });
        if tx.try_send(outbound).is_err() {
            tracing::warn!("outbound queue full; disconnecting client");
            return false;
        }
        if closing {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::config::GameRules;
    use crate::constants::EVENT_BUFFER;
    use crate::maze::Maze;
    use crate::questions::{Question, QuestionBank};
    use crate::registry::RegistryOptions;
    use crate::rng::Rng;
    use crate::session::GameSession;
    use crate::types::{Difficulty, Direction};

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            Arc::new(QuestionBank::builtin().unwrap()),
            RegistryOptions::default(),
        ))
    }

    fn json_of(outbound: &Outbound) -> Value {
        match outbound {
            Outbound::Text(raw) => serde_json::from_str(raw).unwrap(),
            Outbound::Close { .. } => panic!("expected a text frame, got {outbound:?}"),
        }
    }

    async fn blocked_move(handle: &SessionHandle) -> String {
        let dir = handle
            .read(|session| {
                let pos = session.player().current_pos;
                Direction::ALL.into_iter().find(|dir| {
                    session
                        .maze()
                        .cell(pos.step(*dir))
                        .map(|cell| !cell.cell_type.is_open() && !cell.is_question_wall)
                        .unwrap_or(true)
                })
            })
            .await
            .unwrap();
        serde_json::json!({ "type": "move", "direction": dir }).to_string()
    }

    // S . Q . E along one corridor, gated by a single "2+2?" question-wall.
    async fn corridor(registry: &SessionRegistry, lives: u32) -> Arc<SessionHandle> {
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
        let session = GameSession::new(
            "game_corridor".to_string(),
            maze,
            Arc::new(bank),
            rules,
            Rng::new(7),
        );
        registry.insert(session).await
    }

    async fn send(channel: &mut RealtimeChannel, raw: &str) -> Value {
        assert!(channel.handle_text(raw).await.is_empty());
        next(channel).await
    }

    const RIGHT: &str = r#"{"type":"move","direction":"RIGHT"}"#;

    async fn next(channel: &mut RealtimeChannel) -> Value {
        let outbound = tokio::time::timeout(Duration::from_secs(1), channel.next_event())
            .await
            .expect("an update should arrive")
            .expect("event stream open");
        json_of(&outbound)
    }

    #[tokio::test]
    async fn attach_sends_a_full_snapshot() {
        let registry = registry();
        let handle = registry.create(7, 7).await.unwrap();
        let (channel, greeting) = RealtimeChannel::attach(registry.clone(), handle.id())
            .await
            .unwrap();

        let value = json_of(&greeting);
        assert_eq!(value["type"], "update");
        assert_eq!(value["payload"]["result"], "Sync");
        assert_eq!(value["payload"]["seq"], 0);
        assert_eq!(value["payload"]["game_state"]["id"], handle.id());
        assert_eq!(handle.attached_channels(), 1);

        drop(channel);
        assert_eq!(handle.attached_channels(), 0);
    }

    #[tokio::test]
    async fn attach_to_unknown_session_fails() {
        let result = RealtimeChannel::attach(registry(), "game_nope").await;
        assert!(matches!(result, Err(GameError::NotFound(_))));
    }

    #[tokio::test]
    async fn moves_fan_out_to_every_attached_channel() {
        let registry = registry();
        let handle = registry.create(7, 7).await.unwrap();
        let (mut first, _) = RealtimeChannel::attach(registry.clone(), handle.id()).await.unwrap();
        let (mut second, _) = RealtimeChannel::attach(registry.clone(), handle.id()).await.unwrap();

        let raw = blocked_move(&handle).await;
        assert!(first.handle_text(&raw).await.is_empty());

        for channel in [&mut first, &mut second] {
            let value = next(channel).await;
            assert_eq!(value["payload"]["seq"], 1);
            assert_eq!(value["payload"]["result"], "Blocked");
            assert_eq!(value["payload"]["status"], "ACTIVE");
        }
    }

    #[tokio::test]
    async fn correct_answer_opens_the_wall_and_exit_carries_final_state() {
        let registry = registry();
        let handle = corridor(&registry, 3).await;
        let (mut channel, _) = RealtimeChannel::attach(registry.clone(), handle.id())
            .await
            .unwrap();

        assert_eq!(send(&mut channel, RIGHT).await["payload"]["result"], "Moved");
        let hit = send(&mut channel, RIGHT).await;
        assert_eq!(hit["payload"]["result"], "QuestionWallHit");
        assert_eq!(hit["payload"]["question"]["id"], 1);

        let answer = r#"{"type":"answer","question_id":1,"answer":"4"}"#;
        let update = send(&mut channel, answer).await;
        let payload = &update["payload"];
        assert_eq!(payload["seq"], 3);
        assert_eq!(payload["result"], "Correct");
        assert_eq!(payload["correct"], true);
        assert_eq!(payload["opened_wall"], serde_json::json!({ "x": 3, "y": 1 }));
        assert_eq!(payload["player"]["score"], 10);
        assert_eq!(payload["player"]["lives"], 3);
        assert_eq!(payload["status"], "ACTIVE");
        assert!(payload.get("game_state").is_none());

        assert_eq!(send(&mut channel, RIGHT).await["payload"]["result"], "Moved");
        assert_eq!(send(&mut channel, RIGHT).await["payload"]["result"], "Moved");
        let win = send(&mut channel, RIGHT).await;
        let payload = &win["payload"];
        assert_eq!(payload["result"], "Win");
        assert_eq!(payload["status"], "WON");
        assert_eq!(payload["game_state"]["status"], "WON");
        assert_eq!(payload["game_state"]["player"]["score"], 10);
        assert_eq!(
            payload["game_state"]["opened_walls"],
            serde_json::json!([{ "x": 3, "y": 1 }])
        );
    }

    #[tokio::test]
    async fn wrong_answer_on_last_life_ends_the_game() {
        let registry = registry();
        let handle = corridor(&registry, 1).await;
        let (mut channel, _) = RealtimeChannel::attach(registry.clone(), handle.id())
            .await
            .unwrap();

        send(&mut channel, RIGHT).await;
        send(&mut channel, RIGHT).await;
        let answer = r#"{"type":"answer","question_id":1,"answer":"3"}"#;
        let update = send(&mut channel, answer).await;
        let payload = &update["payload"];
        assert_eq!(payload["result"], "Incorrect");
        assert_eq!(payload["correct"], false);
        assert!(payload.get("opened_wall").is_none());
        assert_eq!(payload["player"]["lives"], 0);
        assert_eq!(payload["status"], "LOST");
        assert_eq!(payload["game_state"]["status"], "LOST");
        assert_eq!(payload["game_state"]["player"]["lives"], 0);

        let replies = channel.handle_text(RIGHT).await;
        assert_eq!(json_of(&replies[0])["payload"]["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn errors_only_reach_the_offending_connection() {
        let registry = registry();
        let handle = registry.create(7, 7).await.unwrap();
        let (mut first, _) = RealtimeChannel::attach(registry.clone(), handle.id()).await.unwrap();
        let (mut second, _) = RealtimeChannel::attach(registry.clone(), handle.id()).await.unwrap();

        let replies = first.handle_text(r#"{"type":"move","direction":"NORTH"}"#).await;
        assert_eq!(json_of(&replies[0])["payload"]["code"], "MALFORMED_MESSAGE");

        let replies = first
            .handle_text(r#"{"type":"answer","question_id":1,"answer":"x"}"#)
            .await;
        assert_eq!(json_of(&replies[0])["payload"]["code"], "INVALID_STATE");

        let quiet = tokio::time::timeout(Duration::from_millis(50), second.next_event()).await;
        assert!(quiet.is_err());
        assert_eq!(handle.snapshot().await.0, 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let registry = registry();
        let handle = registry.create(5, 5).await.unwrap();
        let (mut channel, _) = RealtimeChannel::attach(registry, handle.id()).await.unwrap();
        let replies = channel.handle_text(r#"{"type":"ping","t":42.0}"#).await;
        let value = json_of(&replies[0]);
        assert_eq!(value["type"], "pong");
        assert_eq!(value["payload"]["t"], 42.0);
    }

    #[tokio::test]
    async fn sync_replaces_state_and_skips_already_covered_updates() {
        let registry = registry();
        let handle = registry.create(5, 5).await.unwrap();
        let (mut channel, _) = RealtimeChannel::attach(registry, handle.id()).await.unwrap();

        let raw = blocked_move(&handle).await;
        channel.handle_text(&raw).await;
        let replies = channel.handle_text(r#"{"type":"sync"}"#).await;
        let value = json_of(&replies[0]);
        assert_eq!(value["payload"]["result"], "Sync");
        assert_eq!(value["payload"]["seq"], 1);

        // seq 1 is still queued on the broadcast but the snapshot already covers it.
        let quiet = tokio::time::timeout(Duration::from_millis(50), channel.next_event()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn lagging_channel_is_resynced_with_a_snapshot() {
        let registry = registry();
        let handle = registry.create(5, 5).await.unwrap();
        let (mut channel, _) = RealtimeChannel::attach(registry, handle.id()).await.unwrap();

        let raw = blocked_move(&handle).await;
        let total = EVENT_BUFFER as u64 + 10;
        for _ in 0..total {
            channel.handle_text(&raw).await;
        }

        let value = next(&mut channel).await;
        assert_eq!(value["payload"]["result"], "Sync");
        assert_eq!(value["payload"]["seq"], total);
    }

    #[tokio::test]
    async fn removed_session_yields_not_found_then_close() {
        let registry = registry();
        let handle = registry.create(5, 5).await.unwrap();
        let (mut channel, _) = RealtimeChannel::attach(registry.clone(), handle.id())
            .await
            .unwrap();
        registry.remove(handle.id()).await;

        let replies = channel.handle_text(r#"{"type":"move","direction":"UP"}"#).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(json_of(&replies[0])["payload"]["code"], "NOT_FOUND");
        assert!(matches!(
            replies[1],
            Outbound::Close {
                code: SESSION_GONE_CLOSE_CODE,
                ..
            }
        ));
    }

    #[test]
    fn enqueue_stops_after_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let open = enqueue(
            &tx,
            vec![
                Outbound::Text("a".into()),
                Outbound::Close {
                    code: 1000,
                    reason: String::new(),
                },
                Outbound::Text("b".into()),
            ],
        );
        assert!(!open);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("a".into()));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { .. }));
        assert!(rx.try_recv().is_err());
    }
}
