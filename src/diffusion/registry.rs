//! GenerationState registry (§3, §5). Process-wide per DSM; TTL-evicted on a
//! sweep interval. Grounded on the donor's usage-stats TTL/eviction idiom
//! (`Arc<RwLock<HashMap<_>>>` plus a periodic background sweep task).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loading,
    Diffusion,
    Decoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: u32,
    pub total_steps: u32,
    pub stage: Stage,
    pub percentage: f32,
    pub current_image: Option<u32>,
    pub total_images: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub data: String,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub images: Vec<GeneratedImage>,
    pub format: String,
    pub time_taken_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationError {
    pub message: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: Status,
    pub progress: Option<Progress>,
    pub result: Option<GenerationResult>,
    pub error: Option<GenerationError>,
}

impl GenerationState {
    pub fn new_pending(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            status: Status::Pending,
            progress: None,
            result: None,
            error: None,
        }
    }
}

struct Entry {
    state: GenerationState,
    last_touched: std::time::Instant,
}

/// Registry GC defaults (§5): TTL 5 min, sweep interval 1 min.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct GenerationRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl GenerationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn insert(&self, state: GenerationState) {
        self.entries.write().insert(
            state.id.clone(),
            Entry {
                state,
                last_touched: std::time::Instant::now(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<GenerationState> {
        self.entries.read().get(id).map(|e| e.state.clone())
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut GenerationState)) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            f(&mut entry.state);
            entry.state.updated_at = Utc::now();
            entry.last_touched = std::time::Instant::now();
        }
    }

    fn sweep(&self) {
        let ttl = self.ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.last_touched.elapsed() < ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "generation registry GC sweep evicted entries");
        }
    }

    /// Spawns the background sweep task. Returns the handle so the owner can
    /// abort it on server stop (§4.3.1 "drain registry GC timer").
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}
