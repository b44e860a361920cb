//! Tunnel session state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track session state (Dialing → Handshaking → Relaying → Closed)
//! - Generate unique session IDs for tracing
//! - Count live sessions so leaks are observable
//!
//! A session holds connections only while Handshaking or Relaying. The
//! tracker slot is taken on dial success and given back exactly once, when
//! the session reaches Closed or is dropped, whichever comes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Global atomic counter for session IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connecting to the backend.
    Dialing,
    /// Backend connected, client upgrade in progress.
    Handshaking,
    /// Both connections live, messages flowing.
    Relaying,
    /// Absorbing. Both connections released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    DialSucceeded,
    DialFailed,
    UpgradeSucceeded,
    UpgradeFailed,
    RelayTerminated,
}

impl SessionState {
    /// Next state after `event`. Events that do not apply leave the state as is.
    pub fn next(self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Dialing, DialSucceeded) => Handshaking,
            (Dialing, DialFailed) => Closed,
            (Handshaking, UpgradeSucceeded) => Relaying,
            (Handshaking, UpgradeFailed) => Closed,
            (Relaying, RelayTerminated) => Closed,
            (state, _) => state,
        }
    }

    /// Whether connections are owned in this state.
    pub fn holds_connections(self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Relaying)
    }
}

/// Counts live tunnel sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    active_count: Arc<AtomicU64>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live session. Returns a guard that decrements on drop.
    pub fn track(&self) -> SessionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            active_count: Arc::clone(&self.active_count),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Tracker slot held while a session owns connections.
#[derive(Debug)]
pub struct SessionGuard {
    active_count: Arc<AtomicU64>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One websocket tunnel from first dial to release.
#[derive(Debug)]
pub struct TunnelSession {
    id: SessionId,
    state: SessionState,
    tracker: SessionTracker,
    guard: Option<SessionGuard>,
}

impl TunnelSession {
    pub fn new(tracker: SessionTracker) -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::Dialing,
            tracker,
            guard: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply `event` and return the resulting state.
    pub fn advance(&mut self, event: SessionEvent) -> SessionState {
        let next = self.state.next(event);
        if next != self.state {
            tracing::trace!(
                session_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Session state changed"
            );
        }
        self.state = next;

        if next.holds_connections() {
            if self.guard.is_none() {
                self.guard = Some(self.tracker.track());
            }
        } else {
            self.guard = None;
        }
        next
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!(
                session_id = %self.id,
                state = ?self.state,
                "Session released before reaching Closed"
            );
        }
    }
}

/// A [`TunnelSession`] shared between the upgrade callbacks.
///
/// Exactly one of the success and failure callbacks runs, so whichever one
/// fires moves the session on.
#[derive(Debug, Clone)]
pub struct SharedSession {
    id: SessionId,
    inner: Arc<Mutex<TunnelSession>>,
}

impl SharedSession {
    pub fn new(session: TunnelSession) -> Self {
        Self {
            id: session.id(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state()
    }

    pub fn advance(&self, event: SessionEvent) -> SessionState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance(event)
    }
}
