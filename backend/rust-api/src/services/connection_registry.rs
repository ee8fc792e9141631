use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::activity_log::ActivityRecorder;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::models::{ActivityEvent, ActivityKind, ChangeEvent, ConnectionSession, ConnectionStats};

type ConnectionKey = (String, String);

fn key(attempt_id: &str, connection_id: &str) -> ConnectionKey {
    (attempt_id.to_string(), connection_id.to_string())
}

enum IdleCheck {
    Gone,
    Expired(ConnectionSession),
    Active(Duration),
}

/// Process-local bookkeeping for client connections.
///
/// Each connection owns its own FIFO buffer and in-flight flag. Nothing here
/// is needed for correctness: the store's version check decides every write,
/// so losing an entry only costs batching.
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionKey, ConnectionSession>,
    idle_timeout: Duration,
    next_generation: AtomicU64,
    activity: ActivityRecorder,
}

impl ConnectionRegistry {
    pub fn new(idle_timeout: Duration, activity: ActivityRecorder) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            next_generation: AtomicU64::new(1),
            activity,
        }
    }

    /// Creates or resets the session and (re)arms its idle watcher.
    ///
    /// A reset refreshes activity and version but keeps buffered changes and
    /// an in-flight flag, so a running flush is never orphaned.
    pub fn open(self: &Arc<Self>, attempt_id: &str, connection_id: &str, known_version: i64) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let k = key(attempt_id, connection_id);
        let reopened = match self.sessions.get_mut(&k) {
            Some(mut session) => {
                session.touch();
                session.known_version = session.known_version.max(known_version);
                session.generation = generation;
                true
            }
            None => false,
        };
        if !reopened {
            self.sessions.insert(
                k.clone(),
                ConnectionSession::new(attempt_id, connection_id, known_version, generation),
            );
        }
        self.update_gauge();

        tracing::info!(
            "Connection {} {} for attempt {} at v{}",
            connection_id,
            if reopened { "reset" } else { "opened" },
            attempt_id,
            known_version
        );
        self.activity.record(
            ActivityEvent::new(attempt_id, ActivityKind::ConnectionOpened)
                .with_connection(connection_id)
                .with_details(json!({ "version": known_version, "reopened": reopened })),
        );
        self.spawn_idle_watcher(k, generation);
    }

    /// Opens the session on first contact; returns false if it already existed.
    pub fn ensure(self: &Arc<Self>, attempt_id: &str, connection_id: &str, known_version: i64) -> bool {
        if self.sessions.contains_key(&key(attempt_id, connection_id)) {
            return false;
        }
        self.open(attempt_id, connection_id, known_version);
        true
    }

    pub fn close(&self, attempt_id: &str, connection_id: &str) -> Option<ConnectionSession> {
        let (_, session) = self.sessions.remove(&key(attempt_id, connection_id))?;
        self.update_gauge();

        if !session.pending_changes.is_empty() {
            tracing::warn!(
                "Connection {} on attempt {} closed with {} unsent changes",
                connection_id,
                attempt_id,
                session.pending_changes.len()
            );
        }
        tracing::info!("Connection {} closed for attempt {}", connection_id, attempt_id);
        self.activity.record(
            ActivityEvent::new(attempt_id, ActivityKind::ConnectionClosed)
                .with_connection(connection_id)
                .with_details(json!({ "unsent_changes": session.pending_changes.len() })),
        );
        Some(session)
    }

    pub fn contains(&self, attempt_id: &str, connection_id: &str) -> bool {
        self.sessions.contains_key(&key(attempt_id, connection_id))
    }

    pub fn touch(&self, attempt_id: &str, connection_id: &str) -> bool {
        match self.sessions.get_mut(&key(attempt_id, connection_id)) {
            Some(mut session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Appends to the connection's buffer in arrival order.
    pub fn enqueue(&self, attempt_id: &str, connection_id: &str, changes: Vec<ChangeEvent>) -> bool {
        match self.sessions.get_mut(&key(attempt_id, connection_id)) {
            Some(mut session) => {
                session.touch();
                session.pending_changes.extend(changes);
                true
            }
            None => false,
        }
    }

    /// Claims the in-flight flag. False if another flush holds it.
    pub fn try_begin_sync(&self, attempt_id: &str, connection_id: &str) -> bool {
        match self.sessions.get_mut(&key(attempt_id, connection_id)) {
            Some(mut session) if !session.sync_in_progress => {
                session.sync_in_progress = true;
                true
            }
            _ => false,
        }
    }

    pub fn take_pending(&self, attempt_id: &str, connection_id: &str) -> Vec<ChangeEvent> {
        self.sessions
            .get_mut(&key(attempt_id, connection_id))
            .map(|mut session| session.pending_changes.drain(..).collect())
            .unwrap_or_default()
    }

    /// Puts unsent changes back ahead of anything queued meanwhile.
    pub fn requeue_front(&self, attempt_id: &str, connection_id: &str, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        match self.sessions.get_mut(&key(attempt_id, connection_id)) {
            Some(mut session) => {
                for event in events.into_iter().rev() {
                    session.pending_changes.push_front(event);
                }
            }
            None => tracing::warn!(
                "Connection {} on attempt {} is gone, {} unsent changes not requeued",
                connection_id,
                attempt_id,
                events.len()
            ),
        }
    }

    /// Releases the in-flight flag only if nothing was queued meanwhile.
    /// Returns false when the caller must keep draining.
    pub fn finish_sync(&self, attempt_id: &str, connection_id: &str) -> bool {
        match self.sessions.get_mut(&key(attempt_id, connection_id)) {
            Some(mut session) => {
                if session.pending_changes.is_empty() {
                    session.sync_in_progress = false;
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    pub fn abort_sync(&self, attempt_id: &str, connection_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(&key(attempt_id, connection_id)) {
            session.sync_in_progress = false;
        }
    }

    pub fn is_syncing(&self, attempt_id: &str, connection_id: &str) -> bool {
        self.sessions
            .get(&key(attempt_id, connection_id))
            .map(|s| s.sync_in_progress)
            .unwrap_or(false)
    }

    pub fn pending_len(&self, attempt_id: &str, connection_id: &str) -> usize {
        self.sessions
            .get(&key(attempt_id, connection_id))
            .map(|s| s.pending_changes.len())
            .unwrap_or(0)
    }

    pub fn known_version(&self, attempt_id: &str, connection_id: &str) -> Option<i64> {
        self.sessions
            .get(&key(attempt_id, connection_id))
            .map(|s| s.known_version)
    }

    /// Advances one connection to at least `version`. Other connections on
    /// the attempt keep the version they last saw, so their next save is
    /// checked against it.
    pub fn record_version(&self, attempt_id: &str, connection_id: &str, version: i64) {
        if let Some(mut session) = self.sessions.get_mut(&key(attempt_id, connection_id)) {
            if session.known_version < version {
                session.known_version = version;
            }
        }
    }

    /// Clears every buffer on the attempt; returns how many events were dropped.
    pub fn drop_pending_for_attempt(&self, attempt_id: &str) -> usize {
        let mut dropped = 0;
        for mut session in self.sessions.iter_mut() {
            if session.attempt_id == attempt_id {
                dropped += session.pending_changes.len();
                session.pending_changes.clear();
            }
        }
        dropped
    }

    /// Sets every connection on the attempt to the authoritative version.
    pub fn reseed_attempt(&self, attempt_id: &str, version: i64) {
        for mut session in self.sessions.iter_mut() {
            if session.attempt_id == attempt_id {
                session.known_version = version;
                session.touch();
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut attempts = HashSet::new();
        let mut active_connections = 0;
        for session in self.sessions.iter() {
            active_connections += 1;
            attempts.insert(session.attempt_id.clone());
        }
        ConnectionStats {
            active_connections,
            active_attempts: attempts.len(),
        }
    }

    fn update_gauge(&self) {
        CONNECTIONS_ACTIVE.set(self.sessions.len() as i64);
    }

    fn check_idle(&self, k: &ConnectionKey, generation: u64) -> IdleCheck {
        let idle = self.idle_timeout;
        let remaining = match self.sessions.get(k) {
            None => return IdleCheck::Gone,
            Some(session) if session.generation != generation => return IdleCheck::Gone,
            Some(session) if session.sync_in_progress => idle,
            Some(session) => idle.saturating_sub(session.last_activity.elapsed()),
        };
        if !remaining.is_zero() {
            return IdleCheck::Active(remaining);
        }

        match self.sessions.remove_if(k, |_, s| {
            s.generation == generation && !s.sync_in_progress && s.last_activity.elapsed() >= idle
        }) {
            Some((_, session)) => IdleCheck::Expired(session),
            None => IdleCheck::Active(idle),
        }
    }

    fn spawn_idle_watcher(self: &Arc<Self>, k: ConnectionKey, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry: Weak<Self> = Arc::downgrade(self);
        let mut wait = self.idle_timeout;

        runtime.spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                match registry.check_idle(&k, generation) {
                    IdleCheck::Gone => return,
                    IdleCheck::Active(remaining) => wait = remaining,
                    IdleCheck::Expired(session) => {
                        registry.update_gauge();
                        registry.on_expired(session);
                        return;
                    }
                }
            }
        });
    }

    fn on_expired(&self, session: ConnectionSession) {
        let unsent = session.pending_changes.len();
        if unsent > 0 {
            tracing::warn!(
                "Connection {} on attempt {} expired with {} unsent changes",
                session.connection_id,
                session.attempt_id,
                unsent
            );
        } else {
            tracing::info!(
                "Connection {} on attempt {} expired after inactivity",
                session.connection_id,
                session.attempt_id
            );
        }
        self.activity.record(
            ActivityEvent::new(session.attempt_id.as_str(), ActivityKind::ConnectionExpired)
                .with_connection(session.connection_id.as_str())
                .with_details(json!({ "unsent_changes": unsent })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::activity_log::InMemoryActivitySink;

    fn registry(idle: Duration) -> (Arc<ConnectionRegistry>, Arc<InMemoryActivitySink>) {
        let sink = Arc::new(InMemoryActivitySink::new());
        let registry = Arc::new(ConnectionRegistry::new(idle, ActivityRecorder::new(sink.clone())));
        (registry, sink)
    }

    fn change(q: &str) -> ChangeEvent {
        ChangeEvent::answer(q, serde_json::json!("A"))
    }

    #[tokio::test]
    async fn stats_count_distinct_connections_and_attempts() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab-1", 1);
        registry.open("a1", "tab-2", 1);
        registry.open("a2", "tab-1", 3);

        let stats = registry.stats();
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.active_attempts, 2);

        registry.close("a1", "tab-1");
        registry.close("a1", "tab-2");
        assert_eq!(registry.stats().active_attempts, 1);
    }

    #[tokio::test]
    async fn in_flight_flag_is_exclusive_per_connection() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab-1", 1);
        registry.open("a1", "tab-2", 1);

        assert!(registry.try_begin_sync("a1", "tab-1"));
        assert!(!registry.try_begin_sync("a1", "tab-1"));
        assert!(registry.try_begin_sync("a1", "tab-2"));
        assert!(!registry.try_begin_sync("a1", "missing"));
    }

    #[tokio::test]
    async fn finish_keeps_flag_while_changes_are_pending() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab", 1);
        assert!(registry.try_begin_sync("a1", "tab"));

        registry.enqueue("a1", "tab", vec![change("q1")]);
        assert!(!registry.finish_sync("a1", "tab"));
        assert!(registry.is_syncing("a1", "tab"));

        assert_eq!(registry.take_pending("a1", "tab").len(), 1);
        assert!(registry.finish_sync("a1", "tab"));
        assert!(!registry.is_syncing("a1", "tab"));
    }

    #[tokio::test]
    async fn requeued_changes_go_ahead_of_new_ones() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab", 1);
        registry.enqueue("a1", "tab", vec![change("q3")]);
        registry.requeue_front("a1", "tab", vec![change("q1"), change("q2")]);

        let order: Vec<String> = registry
            .take_pending("a1", "tab")
            .into_iter()
            .map(|c| c.question_id)
            .collect();
        assert_eq!(order, vec!["q1", "q2", "q3"]);
    }

    #[tokio::test]
    async fn reopen_keeps_buffer_and_raises_version() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab", 1);
        registry.enqueue("a1", "tab", vec![change("q1")]);
        registry.open("a1", "tab", 4);

        assert_eq!(registry.pending_len("a1", "tab"), 1);
        assert_eq!(registry.known_version("a1", "tab"), Some(4));
        assert_eq!(registry.stats().active_connections, 1);
    }

    #[tokio::test]
    async fn drop_and_reseed_touch_every_connection_on_the_attempt() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab-1", 1);
        registry.open("a1", "tab-2", 1);
        registry.open("a2", "tab-1", 1);
        registry.enqueue("a1", "tab-1", vec![change("q1"), change("q2")]);
        registry.enqueue("a1", "tab-2", vec![change("q3")]);
        registry.enqueue("a2", "tab-1", vec![change("q4")]);

        assert_eq!(registry.drop_pending_for_attempt("a1"), 3);
        registry.reseed_attempt("a1", 9);

        assert_eq!(registry.known_version("a1", "tab-2"), Some(9));
        assert_eq!(registry.known_version("a2", "tab-1"), Some(1));
        assert_eq!(registry.pending_len("a2", "tab-1"), 1);
    }

    #[tokio::test]
    async fn recorded_version_only_moves_that_connection() {
        let (registry, _) = registry(Duration::from_secs(60));
        registry.open("a1", "tab-1", 1);
        registry.open("a1", "tab-2", 1);

        registry.record_version("a1", "tab-1", 3);
        registry.record_version("a1", "tab-1", 2);

        assert_eq!(registry.known_version("a1", "tab-1"), Some(3));
        assert_eq!(registry.known_version("a1", "tab-2"), Some(1));
    }

    #[tokio::test]
    async fn idle_connections_expire() {
        let (registry, sink) = registry(Duration::from_millis(40));
        registry.open("a1", "tab", 1);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!registry.contains("a1", "tab"));
        let kinds: Vec<ActivityKind> = sink.events_for("a1").iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ActivityKind::ConnectionExpired));
    }

    #[tokio::test]
    async fn activity_postpones_expiry() {
        let (registry, _) = registry(Duration::from_millis(80));
        registry.open("a1", "tab", 1);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(registry.touch("a1", "tab"));
        }
        assert!(registry.contains("a1", "tab"));
    }

    #[tokio::test]
    async fn connection_mid_flush_is_not_expired() {
        let (registry, _) = registry(Duration::from_millis(30));
        registry.open("a1", "tab", 1);
        assert!(registry.try_begin_sync("a1", "tab"));

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(registry.contains("a1", "tab"));
    }
}
