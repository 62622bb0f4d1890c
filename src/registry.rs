//! Process-wide table of live sessions.
//!
//! The map lock is only held for insert / lookup / remove. Each session sits
//! behind its own mutex, which is the single-writer point for moves and
//! answers: the sequence number is bumped and the update is broadcast while
//! that mutex is held, so every attached channel sees updates in apply order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::distr::Alphanumeric;
use rand::Rng as _;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::GameRules;
use crate::constants::{normalize_dimension, EVENT_BUFFER, LARGE_BOARD_CELLS};
use crate::error::GameError;
use crate::maze::{generate_maze_with_seed, MazeOptions};
use crate::protocol::UpdatePayload;
use crate::questions::QuestionBank;
use crate::rng::Rng;
use crate::session::{AnswerOutcome, GameSession, MoveOutcome};
use crate::types::{Direction, GameStateView};

#[derive(Clone, Copy, Debug, Default)]
pub struct RegistryOptions {
    pub rules: GameRules,
    pub maze: MazeOptions,
}

struct SessionSlot {
    session: GameSession,
    seq: u64,
}

pub struct SessionHandle {
    id: String,
    slot: Mutex<SessionSlot>,
    events: broadcast::Sender<Arc<UpdatePayload>>,
    attached: AtomicUsize,
    last_active_ms: AtomicU64,
}

impl SessionHandle {
    fn new(session: GameSession) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            id: session.id().to_string(),
            slot: Mutex::new(SessionSlot { session, seq: 0 }),
            events,
            attached: AtomicUsize::new(0),
            last_active_ms: AtomicU64::new(now_ms()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn apply_move(&self, dir: Direction) -> Result<MoveOutcome, GameError> {
        self.apply_move_with(dir, |_| ()).await.map(|(outcome, _)| outcome)
    }

    /// Applies a move and lets `inspect` read the session before the lock is released.
    pub async fn apply_move_with<R>(
        &self,
        dir: Direction,
        inspect: impl FnOnce(&GameSession) -> R,
    ) -> Result<(MoveOutcome, R), GameError> {
        let mut slot = self.slot.lock().await;
        self.touch();
        let outcome = slot.session.apply_move(dir)?;
        slot.seq += 1;
        let update = UpdatePayload::for_move(slot.seq, &outcome, &slot.session);
        self.publish(update);
        tracing::debug!(session_id = %self.id, result = ?outcome.result, "move applied");
        Ok((outcome, inspect(&slot.session)))
    }

    pub async fn answer(&self, question_id: u32, answer: &str) -> Result<AnswerOutcome, GameError> {
        self.answer_with(question_id, answer, |_| ())
            .await
            .map(|(outcome, _)| outcome)
    }

    pub async fn answer_with<R>(
        &self,
        question_id: u32,
        answer: &str,
        inspect: impl FnOnce(&GameSession) -> R,
    ) -> Result<(AnswerOutcome, R), GameError> {
        let mut slot = self.slot.lock().await;
        self.touch();
        let outcome = slot.session.answer(question_id, answer)?;
        slot.seq += 1;
        let update = UpdatePayload::for_answer(slot.seq, &outcome, &slot.session);
        self.publish(update);
        tracing::debug!(session_id = %self.id, correct = outcome.correct, "answer judged");
        Ok((outcome, inspect(&slot.session)))
    }

    pub async fn snapshot(&self) -> (u64, GameStateView) {
        let slot = self.slot.lock().await;
        (slot.seq, slot.session.snapshot())
    }

    pub async fn read<R>(&self, inspect: impl FnOnce(&GameSession) -> R) -> R {
        let slot = self.slot.lock().await;
        inspect(&slot.session)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UpdatePayload>> {
        self.events.subscribe()
    }

    pub fn attach(self: &Arc<Self>) -> Attachment {
        self.attached.fetch_add(1, Ordering::AcqRel);
        self.touch();
        Attachment {
            handle: Arc::clone(self),
        }
    }

    pub fn attached_channels(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    fn publish(&self, update: UpdatePayload) {
        // No receivers just means nobody is attached right now.
        let _ = self.events.send(Arc::new(update));
    }

    fn touch(&self) {
        self.last_active_ms.store(now_ms(), Ordering::Release);
    }

    fn idle_since(&self, now_ms: u64) -> Option<u64> {
        if self.attached_channels() > 0 {
            return None;
        }
        Some(now_ms.saturating_sub(self.last_active_ms.load(Ordering::Acquire)))
    }
}

pub struct Attachment {
    handle: Arc<SessionHandle>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.handle.attached.fetch_sub(1, Ordering::AcqRel);
        self.handle.touch();
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    bank: Arc<QuestionBank>,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(bank: Arc<QuestionBank>, options: RegistryOptions) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bank,
            options,
        }
    }

    pub fn bank(&self) -> &Arc<QuestionBank> {
        &self.bank
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    pub async fn create(&self, rows: i64, cols: i64) -> Result<Arc<SessionHandle>, GameError> {
        let max = self.options.maze.max_dimension;
        let rows = normalize_dimension(rows, max);
        let cols = normalize_dimension(cols, max);
        let mut rng = Rng::from_entropy();
        let seed = rng.next_u32();
        let maze_options = self.options.maze;

        let maze = if rows * cols >= LARGE_BOARD_CELLS {
            tokio::task::spawn_blocking(move || {
                generate_maze_with_seed(rows, cols, &maze_options, seed)
            })
            .await
            .map_err(|err| {
                tracing::error!(%err, rows, cols, "maze generation task failed");
                GameError::GenerationFailure { attempts: 0 }
            })??
        } else {
            generate_maze_with_seed(rows, cols, &maze_options, seed)?
        };

        let mut sessions = self.sessions.write().await;
        let mut id = make_session_id();
        while sessions.contains_key(&id) {
            id = make_session_id();
        }
        let session = GameSession::new(
            id.clone(),
            maze,
            Arc::clone(&self.bank),
            self.options.rules,
            rng.fork(),
        );
        let handle = Arc::new(SessionHandle::new(session));
        sessions.insert(id.clone(), Arc::clone(&handle));
        tracing::info!(
            session_id = %id,
            rows,
            cols,
            seed,
            active = sessions.len(),
            "session created"
        );
        Ok(handle)
    }

    pub async fn insert(&self, session: GameSession) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(session));
        let mut sessions = self.sessions.write().await;
        if sessions
            .insert(handle.id().to_string(), Arc::clone(&handle))
            .is_some()
        {
            tracing::warn!(session_id = %handle.id(), "session replaced");
        }
        tracing::info!(session_id = %handle.id(), active = sessions.len(), "session inserted");
        handle
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>, GameError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GameError::NotFound(id.to_string()))
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            tracing::info!(session_id = %id, "session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        self.evict_idle_at(now_ms(), max_idle).await
    }

    pub async fn evict_idle_at(&self, now_ms: u64, max_idle: Duration) -> Vec<String> {
        let limit = max_idle.as_millis() as u64;
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();
        sessions.retain(|id, handle| match handle.idle_since(now_ms) {
            Some(idle) if idle >= limit => {
                evicted.push(id.clone());
                false
            }
            _ => true,
        });
        for id in &evicted {
            tracing::info!(session_id = %id, "idle session evicted");
        }
        evicted
    }
}

pub fn spawn_idle_sweeper(
    registry: Arc<SessionRegistry>,
    every: Duration,
    max_idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = registry.evict_idle(max_idle).await;
            if !evicted.is_empty() {
                tracing::debug!(count = evicted.len(), "idle sweep finished");
            }
        }
    })
}

fn make_session_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("game_{suffix}")
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
