// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Operator session tracking with idle eviction.
//!
//! Sessions are keyed by an opaque random token and kept in a single
//! mutex-guarded map. A dedicated reaper thread wakes every
//! `monitor_interval` and evicts one idle session per sweep: several
//! overdue sessions are drained over consecutive sweeps, not all at once.
//!
//! ## Audit
//!
//! Lifecycle events are logged as single audit lines:
//!
//! ```text
//! 2025-01-15 10:00:00 UTC | SESSION_CREATED | session=sess_... user=admin@org
//! 2025-01-15 11:00:05 UTC | SESSION_EVICTED | session=sess_... user=admin@org idle=3605s
//! ```

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::conn::Connection;
use crate::registry::{CommandModule, CommandSpec, ModuleSpec};
use crate::security::locks::resilient_lock;

/// Default inactivity limit before a session is evicted.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

/// Default time between reaper sweeps. Also used when zero is configured.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 5;

/// Bound on how long `shutdown` waits for the reaper thread.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN_PREFIX: &str = "sess_";
const TOKEN_BYTES: usize = 16;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// =============================================================================
// AUDIT EVENTS
// =============================================================================

/// Session events for audit logging
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { token: String, user_name: String },
    Ended { token: String, user_name: String },
    Evicted { token: String, user_name: String, idle_secs: u64 },
}

impl SessionEvent {
    /// Format event for audit log
    pub fn to_audit_string(&self) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        match self {
            SessionEvent::Created { token, user_name } => {
                format!("{} | SESSION_CREATED | session={} user={}", timestamp, token, user_name)
            }
            SessionEvent::Ended { token, user_name } => {
                format!("{} | SESSION_ENDED | session={} user={}", timestamp, token, user_name)
            }
            SessionEvent::Evicted { token, user_name, idle_secs } => {
                format!(
                    "{} | SESSION_EVICTED | session={} user={} idle={}s",
                    timestamp, token, user_name, idle_secs
                )
            }
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One authenticated operator session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_name: String,
    pub token: String,
    pub created_at: Instant,
    pub created_at_utc: DateTime<Utc>,
    last_active: Instant,
    last_active_utc: DateTime<Utc>,
}

impl Session {
    fn new(user_name: String, token: String) -> Self {
        let now = Instant::now();
        let now_utc = Utc::now();
        Self {
            user_name,
            token,
            created_at: now,
            created_at_utc: now_utc,
            last_active: now,
            last_active_utc: now_utc,
        }
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn last_active_utc(&self) -> DateTime<Utc> {
        self.last_active_utc
    }

    /// Time since the last confirmed activity.
    pub fn idle(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Record activity. The last-active instant always moves forward.
    pub fn mark_active(&mut self) {
        let now = Instant::now();
        self.last_active = if now > self.last_active {
            now
        } else {
            self.last_active + Duration::from_nanos(1)
        };
        self.last_active_utc = Utc::now();
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<String, Session>>>;

struct Reaper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Live sessions plus the background reaper that evicts idle ones.
pub struct SessionManager {
    sessions: SessionMap,
    idle_timeout: Duration,
    monitor_interval: Duration,
    reaper: Mutex<Option<Reaper>>,
}

impl SessionManager {
    /// Create the manager and start its reaper thread.
    pub fn new(config: SessionConfig) -> Self {
        let monitor_interval = if config.monitor_interval.is_zero() {
            tracing::warn!(
                "session monitor interval must be positive; using {}s",
                DEFAULT_MONITOR_INTERVAL_SECS
            );
            Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS)
        } else {
            config.monitor_interval
        };

        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let reaper = spawn_reaper(Arc::clone(&sessions), config.idle_timeout, monitor_interval);

        Self {
            sessions,
            idle_timeout: config.idle_timeout,
            monitor_interval,
            reaper: Mutex::new(reaper),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }

    /// Create and store a session for `user_name`.
    pub fn create_session(&self, user_name: impl Into<String>) -> Session {
        let user_name = user_name.into();
        let mut sessions = resilient_lock(&self.sessions);

        let mut token = generate_token();
        while sessions.contains_key(&token) {
            token = generate_token();
        }

        let session = Session::new(user_name, token.clone());
        sessions.insert(token, session.clone());
        drop(sessions);

        let event = SessionEvent::Created {
            token: session.token.clone(),
            user_name: session.user_name.clone(),
        };
        tracing::info!("{}", event.to_audit_string());
        session
    }

    pub fn get_session(&self, token: &str) -> Option<Session> {
        resilient_lock(&self.sessions).get(token).cloned()
    }

    /// Snapshot of every live session.
    pub fn get_sessions(&self) -> Vec<Session> {
        resilient_lock(&self.sessions).values().cloned().collect()
    }

    /// Confirm activity on a session. Returns `false` if the token is unknown.
    pub fn mark_active(&self, token: &str) -> bool {
        match resilient_lock(&self.sessions).get_mut(token) {
            Some(session) => {
                session.mark_active();
                true
            }
            None => false,
        }
    }

    /// Remove a session. Unknown tokens are ignored.
    pub fn end_session(&self, token: &str) -> Option<Session> {
        let removed = resilient_lock(&self.sessions).remove(token);
        if let Some(session) = &removed {
            let event = SessionEvent::Ended {
                token: session.token.clone(),
                user_name: session.user_name.clone(),
            };
            tracing::info!("{}", event.to_audit_string());
        }
        removed
    }

    /// Run one reaper sweep now. Evicts at most one idle session.
    pub fn reap_idle(&self) -> Option<Session> {
        reap_one(&self.sessions, self.idle_timeout)
    }

    /// Stop the reaper and wait for it, up to a bounded timeout.
    ///
    /// Safe to call repeatedly and after the reaper has already exited.
    pub fn shutdown(&self) {
        let Some(reaper) = resilient_lock(&self.reaper).take() else {
            return;
        };
        let _ = reaper.stop.send(());

        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        while !reaper.handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "session reaper did not stop within {:?}; detaching",
                    SHUTDOWN_JOIN_TIMEOUT
                );
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if reaper.handle.join().is_err() {
            tracing::error!("session reaper thread panicked");
        }
        tracing::debug!("session reaper stopped");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

/// Evict the session that has been idle longest, if it is over the limit.
fn reap_one(sessions: &Mutex<HashMap<String, Session>>, idle_timeout: Duration) -> Option<Session> {
    let mut sessions = resilient_lock(sessions);
    let token = sessions
        .values()
        .filter(|s| s.idle() > idle_timeout)
        .min_by_key(|s| s.last_active)
        .map(|s| s.token.clone())?;
    let session = sessions.remove(&token)?;
    drop(sessions);

    let event = SessionEvent::Evicted {
        token: session.token.clone(),
        user_name: session.user_name.clone(),
        idle_secs: session.idle().as_secs(),
    };
    tracing::info!("{}", event.to_audit_string());
    Some(session)
}

fn spawn_reaper(
    sessions: SessionMap,
    idle_timeout: Duration,
    interval: Duration,
) -> Option<Reaper> {
    let (stop, stop_rx) = mpsc::channel::<()>();
    let spawned = thread::Builder::new()
        .name("session-reaper".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            // A failed sweep is logged; the next one still runs.
            let swept = panic::catch_unwind(AssertUnwindSafe(|| reap_one(&sessions, idle_timeout)));
            if swept.is_err() {
                tracing::error!("session reaper sweep panicked; continuing");
            }
        });

    match spawned {
        Ok(handle) => Some(Reaper { stop, handle }),
        Err(e) => {
            tracing::error!("failed to start session reaper: {}", e);
            None
        }
    }
}

// =============================================================================
// SESSION COMMANDS
// =============================================================================

/// Scope holding the session listing command.
pub const SESSION_SCOPE: &str = "sess";

impl CommandModule for SessionManager {
    fn spec(self: Arc<Self>) -> ModuleSpec {
        let manager = Arc::clone(&self);
        ModuleSpec::new(
            SESSION_SCOPE,
            vec![CommandSpec::new(
                "list_sessions",
                "list user sessions",
                "list_sessions",
                move |conn, _args| {
                    list_sessions(&manager, conn);
                    Ok(())
                },
            )],
        )
    }

    fn close(&self) {
        self.shutdown();
    }
}

fn list_sessions(manager: &SessionManager, conn: &mut Connection) {
    let mut sessions = manager.get_sessions();
    sessions.sort_by(|a, b| {
        a.user_name
            .cmp(&b.user_name)
            .then(a.created_at.cmp(&b.created_at))
    });

    let headers = ["User", "Session ID", "Start", "Last Active", "Idle"];
    let Some(table) = conn.append_table(&headers) else {
        return;
    };
    for s in sessions {
        table.add_row([
            s.user_name.clone(),
            s.token.clone(),
            s.created_at_utc.format(TIME_FORMAT).to_string(),
            s.last_active_utc().format(TIME_FORMAT).to_string(),
            s.idle().as_secs().to_string(),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandRegistry;

    fn manager(idle: Duration, interval: Duration) -> SessionManager {
        SessionManager::new(SessionConfig {
            idle_timeout: idle,
            monitor_interval: interval,
        })
    }

    fn idle_manager() -> SessionManager {
        // Reaper effectively parked; sweeps are driven by hand.
        manager(Duration::from_millis(50), Duration::from_secs(3600))
    }

    #[test]
    fn test_create_and_get_session() {
        let mgr = manager(Duration::from_secs(60), Duration::from_secs(60));
        let session = mgr.create_session("admin@org");

        assert!(session.token.starts_with(TOKEN_PREFIX));
        assert_eq!(session.token.len(), TOKEN_PREFIX.len() + TOKEN_BYTES * 2);
        assert_eq!(session.created_at, session.last_active());

        let fetched = mgr.get_session(&session.token).unwrap();
        assert_eq!(fetched.user_name, "admin@org");
        assert_eq!(mgr.get_sessions().len(), 1);
    }

    #[test]
    fn test_tokens_are_unique() {
        let mgr = manager(Duration::from_secs(60), Duration::from_secs(60));
        let tokens: std::collections::HashSet<String> =
            (0..200).map(|_| mgr.create_session("u").token).collect();
        assert_eq!(tokens.len(), 200);
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let mgr = manager(Duration::from_secs(60), Duration::from_secs(60));
        let session = mgr.create_session("u");

        assert!(mgr.end_session(&session.token).is_some());
        assert!(mgr.end_session(&session.token).is_none());
        assert!(mgr.end_session("sess_unknown").is_none());
        assert!(mgr.get_session(&session.token).is_none());
    }

    #[test]
    fn test_mark_active_strictly_increases() {
        let mgr = manager(Duration::from_secs(60), Duration::from_secs(60));
        let session = mgr.create_session("u");

        let mut previous = session.last_active();
        for _ in 0..50 {
            assert!(mgr.mark_active(&session.token));
            let current = mgr.get_session(&session.token).unwrap().last_active();
            assert!(current > previous);
            previous = current;
        }
        assert!(!mgr.mark_active("sess_missing"));
    }

    #[test]
    fn test_reaper_evicts_one_per_sweep() {
        let mgr = idle_manager();
        mgr.create_session("a");
        mgr.create_session("b");
        mgr.create_session("c");
        thread::sleep(Duration::from_millis(120));

        assert!(mgr.reap_idle().is_some());
        assert_eq!(mgr.get_sessions().len(), 2);
        assert!(mgr.reap_idle().is_some());
        assert!(mgr.reap_idle().is_some());
        assert!(mgr.reap_idle().is_none());
    }

    #[test]
    fn test_reaper_keeps_fresh_sessions() {
        let mgr = idle_manager();
        let stale = mgr.create_session("stale");
        thread::sleep(Duration::from_millis(120));
        let fresh = mgr.create_session("fresh");

        let evicted = mgr.reap_idle().unwrap();
        assert_eq!(evicted.token, stale.token);
        assert!(mgr.reap_idle().is_none());
        assert!(mgr.get_session(&fresh.token).is_some());
    }

    #[test]
    fn test_background_reaper_evicts_idle_session() {
        let mgr = manager(Duration::from_millis(100), Duration::from_millis(25));
        let idle = mgr.create_session("idle");
        let busy = mgr.create_session("busy");

        let deadline = Instant::now() + Duration::from_millis(600);
        while Instant::now() < deadline {
            mgr.mark_active(&busy.token);
            thread::sleep(Duration::from_millis(20));
        }

        assert!(mgr.get_session(&idle.token).is_none());
        assert!(mgr.get_session(&busy.token).is_some());
        mgr.shutdown();
    }

    #[test]
    fn test_zero_interval_is_coerced() {
        let mgr = manager(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(mgr.monitor_interval(), Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS));
    }

    #[test]
    fn test_shutdown_twice() {
        let mgr = manager(Duration::from_secs(1), Duration::from_millis(10));
        mgr.shutdown();
        mgr.shutdown();
    }

    #[test]
    fn test_list_sessions_sorted_by_user() {
        let mgr = Arc::new(manager(Duration::from_secs(60), Duration::from_secs(60)));
        mgr.create_session("zoe");
        mgr.create_session("adam");
        mgr.create_session("mia");

        let registry = CommandRegistry::new();
        registry.register_module(mgr.clone()).unwrap();
        registry.finalize().unwrap();

        let mut conn = Connection::detached();
        registry.process_command(&mut conn, "list_sessions").unwrap();

        let tables = conn.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers()[0], "User");
        assert_eq!(tables[0].headers()[4], "Idle");
        let users: Vec<&str> = tables[0].data_rows().iter().map(|r| r[0].as_str()).collect();
        assert_eq!(users, vec!["adam", "mia", "zoe"]);

        registry.close();
        mgr.shutdown();
    }
}
