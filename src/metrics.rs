//! Process-wide counters for session and broadcast activity.
//! Logged at shutdown; read directly by tests.
use std::sync::atomic::{AtomicU64, Ordering};

static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_HANDLED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_POSTED: AtomicU64 = AtomicU64::new(0);
static NOTICES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static NOTICES_DROPPED: AtomicU64 = AtomicU64::new(0);

pub fn inc_sessions_opened() {
    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_sessions_closed() {
    SESSIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_commands_handled() {
    COMMANDS_HANDLED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_messages_posted() {
    MESSAGES_POSTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_notices_delivered() {
    NOTICES_DELIVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_notices_dropped() {
    NOTICES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub commands_handled: u64,
    pub messages_posted: u64,
    pub notices_delivered: u64,
    pub notices_dropped: u64,
}

impl Snapshot {
    /// Sessions opened but not yet closed.
    pub fn sessions_active(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
        sessions_closed: SESSIONS_CLOSED.load(Ordering::Relaxed),
        commands_handled: COMMANDS_HANDLED.load(Ordering::Relaxed),
        messages_posted: MESSAGES_POSTED.load(Ordering::Relaxed),
        notices_delivered: NOTICES_DELIVERED.load(Ordering::Relaxed),
        notices_dropped: NOTICES_DROPPED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests run in parallel, so only monotonic growth is checked.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_sessions_opened();
        inc_notices_dropped();
        inc_messages_posted();
        let after = snapshot();
        assert!(after.sessions_opened > before.sessions_opened);
        assert!(after.notices_dropped > before.notices_dropped);
        assert!(after.messages_posted > before.messages_posted);
    }

    #[test]
    fn active_sessions_never_underflow() {
        let snap = Snapshot {
            sessions_opened: 1,
            sessions_closed: 3,
            ..Default::default()
        };
        assert_eq!(snap.sessions_active(), 0);
    }
}
