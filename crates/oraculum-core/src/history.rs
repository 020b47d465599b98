//! Per-session conversation history.
//!
//! [`SessionStore`] is process-wide state: created once at startup, torn
//! down with [`SessionStore::shutdown`]. Sessions are created on first
//! access and kept in an LRU map bounded by `capacity`; sessions idle
//! longer than `idle_ttl` are dropped by [`SessionStore::evict_expired`].
//!
//! A session that is in use (an in-flight turn holds its `Arc`, or its
//! turn gate is closed) is never evicted, so at most one [`Session`] object
//! exists per id at any time.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::error::{RagError, RagResult};
use crate::models::Message;

/// Eviction policy for [`SessionStore`].
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Maximum resident sessions. Busy sessions may push the count above
    /// this temporarily.
    pub capacity: NonZeroUsize,
    /// Idle time after which a session may be evicted. `None` disables TTL.
    pub idle_ttl: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
            idle_ttl: Some(Duration::from_secs(3600)),
        }
    }
}

/// One conversation: an ordered, append-only list of messages.
#[derive(Debug)]
pub struct Session {
    id: String,
    messages: Mutex<Vec<Message>>,
    last_access: Mutex<Instant>,
    turn_active: AtomicBool,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            messages: Mutex::new(Vec::new()),
            last_access: Mutex::new(Instant::now()),
            turn_active: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a message, keeping timestamps non-decreasing.
    pub fn append(&self, mut message: Message) {
        let mut messages = lock(&self.messages);
        if let Some(last) = messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        messages.push(message);
        drop(messages);
        self.touch();
    }

    /// Messages in insertion order.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }

    /// Remove all messages. The session itself stays resident.
    pub fn clear(&self) {
        lock(&self.messages).clear();
        self.touch();
    }

    /// Claim the session for one turn.
    ///
    /// Returns `None` if another turn is already running. The gate reopens
    /// when the returned guard is dropped.
    pub fn begin_turn(self: &Arc<Self>) -> Option<TurnGuard> {
        self.turn_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TurnGuard {
                session: Arc::clone(self),
            })
    }

    pub fn turn_active(&self) -> bool {
        self.turn_active.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *lock(&self.last_access) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_access))
    }
}

/// Exclusive claim on a session's turn gate; released on drop.
#[derive(Debug)]
pub struct TurnGuard {
    session: Arc<Session>,
}

impl TurnGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.session.turn_active.store(false, Ordering::Release);
    }
}

/// Keyed store of sessions with LRU and idle-TTL eviction.
pub struct SessionStore {
    sessions: Mutex<LruCache<String, Arc<Session>>>,
    policy: SessionPolicy,
}

impl SessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            sessions: Mutex::new(LruCache::unbounded()),
            policy,
        }
    }

    /// Return the session for `id`, creating it if absent.
    ///
    /// Creation happens under the store lock, so concurrent callers with
    /// the same id always receive the same `Arc<Session>`.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get(id) {
            session.touch();
            return Arc::clone(session);
        }
        let session = Arc::new(Session::new(id));
        sessions.put(id.to_string(), Arc::clone(&session));
        debug!(session = %id, "session created");
        self.evict_over_capacity(&mut sessions);
        session
    }

    /// Look up a session without creating it.
    pub fn get(&self, id: &str) -> RagResult<Arc<Session>> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::SessionNotFound(id.to_string()))
    }

    pub fn append(&self, id: &str, message: Message) {
        self.get_or_create(id).append(message);
    }

    pub fn list(&self, id: &str) -> Vec<Message> {
        self.get_or_create(id).messages()
    }

    pub fn clear(&self, id: &str) {
        self.get_or_create(id).clear();
    }

    /// Drop a session entirely. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        lock(&self.sessions).pop(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.sessions).contains(id)
    }

    /// Number of resident sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Drop sessions idle longer than the TTL. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let Some(ttl) = self.policy.idle_ttl else {
            return 0;
        };
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| is_idle(s) && s.idle_for(now) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            sessions.pop(key);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "expired sessions evicted");
        }
        expired.len()
    }

    /// Drop every session. Called on process shutdown.
    pub fn shutdown(&self) {
        let mut sessions = lock(&self.sessions);
        let count = sessions.len();
        sessions.clear();
        debug!(count, "session store shut down");
    }

    fn evict_over_capacity(&self, sessions: &mut LruCache<String, Arc<Session>>) {
        let capacity = self.policy.capacity.get();
        if sessions.len() <= capacity {
            return;
        }
        let excess = sessions.len() - capacity;
        // `iter()` runs most- to least-recently used.
        let victims: Vec<String> = sessions
            .iter()
            .rev()
            .filter(|(_, s)| is_idle(s))
            .take(excess)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            sessions.pop(key);
        }
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "least-recently-used sessions evicted");
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

/// A session is evictable when only the store holds it and no turn runs.
fn is_idle(session: &Arc<Session>) -> bool {
    Arc::strong_count(session) == 1 && !session.turn_active()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
