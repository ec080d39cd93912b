mod buffer;

use crate::config::SessionConfig;
use buffer::HistoryBuffer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::sleep;

pub use buffer::normalize_line_endings;

pub struct TerminalSession {
    pub id: String,
    created_at: u64,
    last_activity: AtomicU64,
    buffer: Mutex<HistoryBuffer>,
}

impl TerminalSession {
    fn new(id: String, max_chunks: usize, now: u64) -> Self {
        Self {
            id,
            created_at: now,
            last_activity: AtomicU64::new(now),
            buffer: Mutex::new(HistoryBuffer::new(max_chunks)),
        }
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> usize {
        self.lock_buffer().len()
    }

    pub fn contents(&self) -> String {
        self.lock_buffer().concat()
    }

    fn append(&self, text: &str, now: u64) {
        let normalized = normalize_line_endings(text);
        {
            let mut buffer = self.lock_buffer();
            let dropped = buffer.append(normalized);
            if dropped > 0 {
                tracing::debug!(
                    session_id = %self.id,
                    dropped_chunks = dropped,
                    dropped_chunks_total = buffer.dropped_chunks_total(),
                    buffered_bytes = buffer.total_bytes(),
                    "History buffer full; oldest chunks dropped"
                );
            }
        }
        self.touch(now);
    }

    fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::SeqCst);
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, HistoryBuffer> {
        self.buffer.lock().expect("history buffer mutex poisoned")
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    config: SessionConfig,
    sweeper_running: AtomicBool,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            sweeper_running: AtomicBool::new(false),
        })
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<TerminalSession> {
        let now = now_ms();
        if let Some(session) = self.sessions.read().await.get(id).cloned() {
            session.touch(now);
            return session;
        }
        let mut sessions = self.sessions.write().await;
        // Another connection may have raced us between the read and write locks.
        if let Some(session) = sessions.get(id).cloned() {
            session.touch(now);
            return session;
        }
        let session = Arc::new(TerminalSession::new(
            id.to_string(),
            self.config.max_buffer_chunks,
            now,
        ));
        sessions.insert(id.to_string(), session.clone());
        tracing::info!(session_id = %id, "Created terminal session");
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn append(&self, id: &str, text: &str) {
        let Some(session) = self.get(id).await else {
            tracing::debug!(session_id = %id, "Dropping output for unknown session");
            return;
        };
        session.append(text, now_ms());
    }

    pub async fn buffer(&self, id: &str) -> String {
        match self.get(id).await {
            Some(session) => session.contents(),
            None => String::new(),
        }
    }

    pub async fn clear(&self, id: &str) {
        if let Some(session) = self.get(id).await {
            session.lock_buffer().clear();
            tracing::info!(session_id = %id, "Cleared session history");
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "Deleted terminal session");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn sweep_idle(&self) -> Vec<String> {
        self.sweep_idle_at(now_ms()).await
    }

    pub async fn sweep_idle_at(&self, now: u64) -> Vec<String> {
        let timeout = self.config.idle_timeout_ms;
        let mut removed = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, session| {
                let idle_ms = now.saturating_sub(session.last_activity());
                let idle = idle_ms > timeout;
                if idle {
                    tracing::debug!(
                        session_id = %id,
                        idle_ms,
                        age_ms = now.saturating_sub(session.created_at()),
                        "Evicting idle session"
                    );
                    removed.push(id.clone());
                }
                !idle
            });
        }
        if !removed.is_empty() {
            removed.sort();
            tracing::info!(
                count = removed.len(),
                sessions = %removed.join(", "),
                "Swept idle terminal sessions"
            );
        }
        removed
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::clone(self);
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                registry.sweep_idle().await;
            }
        });
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}
