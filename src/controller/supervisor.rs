//! # Supervisor
//!
//! Owns the priority-ordered set of active lock reasons. A periodic check
//! runs every checker, republishes the top reason when it changes, hands
//! the blocked kinds to the mode switcher and records when the system was
//! last healthy. A second, faster task feeds the hardware watchdog only
//! while that record is recent and no fatal reason is active.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::checkers::{internal_reason, startup_reason, CheckContext, Checker};
use crate::domain::{KindSet, LockReason, LockSet};
use crate::hardware::watchdog::Watchdog;
use crate::hardware::{Sink, SinkList};

/// Watchdog feed period
pub const FEED_INTERVAL: Duration = Duration::from_millis(500);

struct SupervisorState {
    locks: LockSet,
    checkers: Vec<Box<dyn Checker>>,
    health_check_passed: Instant,
    /// Name of the last published top reason; `Some("")` is "no lock"
    published_top: Option<&'static str>,
}

pub struct Supervisor {
    check_interval: Duration,
    state: Mutex<SupervisorState>,
    watchdog: Arc<dyn Watchdog>,
    top_changes: SinkList<Option<LockReason>>,
    blocked: SinkList<KindSet>,
}

impl Supervisor {
    /// Starts with only the `startup` reason active
    pub fn new(check_interval: Duration, watchdog: Arc<dyn Watchdog>, now: Instant) -> Self {
        let mut locks = LockSet::new();
        locks.add(&startup_reason());
        Self {
            check_interval,
            state: Mutex::new(SupervisorState {
                locks,
                checkers: Vec::new(),
                health_check_passed: now,
                published_top: None,
            }),
            watchdog,
            top_changes: SinkList::new(),
            blocked: SinkList::new(),
        }
    }

    pub fn register(&self, checker: Box<dyn Checker>) {
        info!(lock = checker.reason().name, "checker registered");
        self.state.lock().checkers.push(checker);
    }

    /// Top reason on change; `None` once every reason is released
    pub fn subscribe_top(&self, sink: Sink<Option<LockReason>>) {
        self.top_changes.subscribe(sink);
    }

    /// Union of blocked kinds after every check
    pub fn subscribe_blocked(&self, sink: Sink<KindSet>) {
        self.blocked.subscribe(sink);
    }

    pub fn locks(&self) -> LockSet {
        self.state.lock().locks.clone()
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn health_check_passed(&self) -> Instant {
        self.state.lock().health_check_passed
    }

    /// One supervision round
    pub fn check_once(&self, now: Instant) {
        let (top, top_changed, blocked) = {
            let mut state = self.state.lock();
            let state = &mut *state;

            let outcome = run_checkers(&mut state.checkers, &mut state.locks, now);
            state.locks.remove(internal_reason().name);
            if let Err(e) = outcome {
                error!(error = %e, "supervision round failed");
                state.locks.add(&internal_reason());
            }

            let top = state.locks.top().cloned();
            let top_name = top.as_ref().map(|r| r.name).unwrap_or("");
            let top_changed = state.published_top != Some(top_name);
            state.published_top = Some(top_name);

            if !state.locks.any_fatal() {
                state.health_check_passed = now;
            }
            (top, top_changed, state.locks.blocked_kinds())
        };

        if top_changed {
            match &top {
                Some(reason) => warn!(lock = reason.name, priority = reason.priority, "top lock changed"),
                None => info!("all locks released"),
            }
            self.top_changes.emit(top);
        }
        self.blocked.emit(blocked);
    }

    /// Whether the watchdog may be fed at `now`
    pub fn healthy(&self, now: Instant) -> bool {
        let state = self.state.lock();
        !state.locks.any_fatal() && now.saturating_duration_since(state.health_check_passed) < self.check_interval * 3
    }

    /// Feeds the watchdog when healthy; returns whether it was fed
    pub fn feed_if_healthy(&self, now: Instant) -> bool {
        if !self.healthy(now) {
            return false;
        }
        match self.watchdog.feed() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "watchdog feed failed");
                false
            }
        }
    }

    pub async fn run_checks(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            self.check_once(Instant::now());
        }
    }

    pub async fn run_watchdog(&self) {
        let mut interval = tokio::time::interval(FEED_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.feed_if_healthy(Instant::now());
        }
    }

    pub fn disarm(&self) {
        if let Err(e) = self.watchdog.disarm() {
            warn!(error = %e, "watchdog disarm failed");
        }
    }
}

fn run_checkers(checkers: &mut [Box<dyn Checker>], locks: &mut LockSet, now: Instant) -> anyhow::Result<()> {
    for checker in checkers.iter_mut() {
        let verdict = {
            let ctx = CheckContext { now, locks: &*locks };
            checker.check(&ctx)?
        };
        let reason = checker.reason();
        match verdict {
            Some(true) => {
                if locks.add(reason) {
                    warn!(lock = reason.name, fatal = reason.fatal, "lock activated");
                }
            }
            Some(false) => {
                if locks.remove(reason.name) {
                    info!(lock = reason.name, "lock released");
                }
            }
            None => {}
        }
    }
    Ok(())
}
