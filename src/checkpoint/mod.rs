//! Thread-scoped checkpoint store
//!
//! Persists each conversation's message history keyed by thread id so a
//! follow-up request continues the same conversation. In-memory only:
//! nothing survives a process restart.

use crate::models::ChatMessage;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Lifecycle of a thread id. There is no path back to `Absent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Absent,
    Active,
}

/// Saved state of one conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub messages: Vec<ChatMessage>,
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trait for checkpoint persistence
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Replace the thread's history. `completed_turn` bumps the turn counter.
    async fn save(
        &self,
        thread_id: &str,
        messages: Vec<ChatMessage>,
        completed_turn: bool,
    ) -> Result<()>;

    async fn state(&self, thread_id: &str) -> Result<ThreadState>;

    /// Lock that serializes turns on one thread id.
    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>>;
}

/// In-memory checkpoint store
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn thread_count(&self) -> usize {
        self.checkpoints.read().await.len()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(thread_id).cloned())
    }

    async fn save(
        &self,
        thread_id: &str,
        messages: Vec<ChatMessage>,
        completed_turn: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut checkpoints = self.checkpoints.write().await;

        let checkpoint = checkpoints
            .entry(thread_id.to_string())
            .or_insert_with(|| Checkpoint {
                thread_id: thread_id.to_string(),
                messages: Vec::new(),
                turn_count: 0,
                created_at: now,
                updated_at: now,
            });

        checkpoint.messages = messages;
        checkpoint.updated_at = now;
        if completed_turn {
            checkpoint.turn_count += 1;
        }

        Ok(())
    }

    async fn state(&self, thread_id: &str) -> Result<ThreadState> {
        let checkpoints = self.checkpoints.read().await;
        Ok(if checkpoints.contains_key(thread_id) {
            ThreadState::Active
        } else {
            ThreadState::Absent
        })
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
