//! # Mode switcher
//!
//! Combines the operator's requested mode with the supervisor's blocked
//! kinds into an effective mode, and drives charger, solar and inverter
//! toward it. Transitions run through the switcher's own FIFO and always
//! address the classes in the order charger, solar, inverter.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::coordinator::{wants_on, ModeTarget};
use super::queue::CommandQueue;
use super::trigger::Trigger;
use crate::domain::{DeviceKind, KindSet, Mode};
use crate::hardware::{Sink, SinkList};

/// Effective mode and whether solar may run
pub fn effective_mode(requested: Mode, blocked: KindSet) -> (Mode, bool) {
    let effective = match requested {
        Mode::Charge if blocked.contains(DeviceKind::Charger) => Mode::Idle,
        Mode::Discharge if blocked.contains(DeviceKind::Inverter) => Mode::Idle,
        other => other,
    };
    let solar_enabled = !blocked.contains(DeviceKind::Solar) && effective != Mode::Protect;
    (effective, solar_enabled)
}

#[derive(Debug, Default)]
struct SwitchState {
    requested: Mode,
    blocked: KindSet,
    /// Last computed (effective mode, solar enabled); `None` before the first evaluation
    current: Option<(Mode, bool)>,
}

/// Class states last applied, in transition order: charger, solar, inverter
#[derive(Debug, Default)]
struct Applied {
    charger: Option<bool>,
    solar: Option<bool>,
    inverter: Option<bool>,
}

pub struct ModeSwitcher {
    state: Mutex<SwitchState>,
    applied: Arc<Mutex<Applied>>,
    charger: Arc<dyn ModeTarget>,
    solar: Arc<dyn ModeTarget>,
    inverter: Arc<dyn ModeTarget>,
    queue: CommandQueue,
    changes: SinkList<Mode>,
}

impl ModeSwitcher {
    pub fn new(charger: Arc<dyn ModeTarget>, solar: Arc<dyn ModeTarget>, inverter: Arc<dyn ModeTarget>) -> Self {
        Self {
            state: Mutex::new(SwitchState::default()),
            applied: Arc::new(Mutex::new(Applied::default())),
            charger,
            solar,
            inverter,
            queue: CommandQueue::new("mode"),
            changes: SinkList::new(),
        }
    }

    /// Receives the effective mode on every change
    pub fn subscribe(&self, sink: Sink<Mode>) {
        self.changes.subscribe(sink);
    }

    pub fn requested(&self) -> Mode {
        self.state.lock().requested
    }

    pub fn effective(&self) -> Mode {
        self.state.lock().current.map(|(m, _)| m).unwrap_or_default()
    }

    pub fn solar_enabled(&self) -> bool {
        self.state.lock().current.is_some_and(|(_, s)| s)
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Operator request, already parsed at the MQTT boundary
    pub fn request(&self, mode: Mode) {
        info!(%mode, "mode requested");
        self.state.lock().requested = mode;
        self.reevaluate();
    }

    /// Union of blocked kinds across all active locks
    pub fn update_locks(&self, blocked: KindSet) {
        self.state.lock().blocked = blocked;
        self.reevaluate();
    }

    /// Recomputes the effective mode; enqueues a transition when it or solar changed
    pub fn reevaluate(&self) {
        let (next, mode_changed) = {
            let mut state = self.state.lock();
            let next = effective_mode(state.requested, state.blocked);
            if state.current == Some(next) {
                return;
            }
            let mode_changed = state.current.map(|(m, _)| m) != Some(next.0);
            state.current = Some(next);
            (next, mode_changed)
        };
        let (mode, solar_enabled) = next;
        info!(%mode, solar_enabled, "effective mode changed");
        self.enqueue_transition(mode, solar_enabled);
        if mode_changed {
            self.changes.emit(mode);
        }
    }

    fn enqueue_transition(&self, mode: Mode, solar_enabled: bool) {
        let charger = self.charger.clone();
        let solar = self.solar.clone();
        let inverter = self.inverter.clone();
        let applied = self.applied.clone();
        self.queue.append("transition", move || async move {
            let solar_mode = if solar_enabled { mode } else { Mode::Protect };
            let steps: [(DeviceKind, &Arc<dyn ModeTarget>, Mode); 3] = [
                (DeviceKind::Charger, &charger, mode),
                (DeviceKind::Solar, &solar, solar_mode),
                (DeviceKind::Inverter, &inverter, mode),
            ];
            for (kind, target, target_mode) in steps {
                let Some(on) = wants_on(kind, target_mode) else {
                    continue;
                };
                let previous = {
                    let applied = applied.lock();
                    match kind {
                        DeviceKind::Charger => applied.charger,
                        DeviceKind::Solar => applied.solar,
                        _ => applied.inverter,
                    }
                };
                if previous == Some(on) {
                    continue;
                }
                debug!(%kind, mode = %target_mode, "transition step");
                target.set_mode(target_mode).await;
                let mut applied = applied.lock();
                match kind {
                    DeviceKind::Charger => applied.charger = Some(on),
                    DeviceKind::Solar => applied.solar = Some(on),
                    _ => applied.inverter = Some(on),
                }
            }
        });
    }

    /// Heartbeat of the effective mode for `mode/actual`
    pub fn on_trigger(&self, trigger: Trigger) -> anyhow::Result<()> {
        if trigger == Trigger::Every300s {
            self.changes.emit(self.effective());
        }
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.queue.run().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::coordinator::MockModeTarget;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    fn any_blocked() -> impl Strategy<Value = KindSet> {
        (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(c, i, s)| {
            let mut set = KindSet::empty();
            if c {
                set.insert(DeviceKind::Charger);
            }
            if i {
                set.insert(DeviceKind::Inverter);
            }
            if s {
                set.insert(DeviceKind::Solar);
            }
            set
        })
    }

    proptest! {
        #[test]
        fn prop_blocked_kinds_gate_mode(blocked in any_blocked(), idx in 0usize..4) {
            let requested = Mode::iter().nth(idx).unwrap();
            let (effective, solar) = effective_mode(requested, blocked);
            if blocked.contains(DeviceKind::Charger) {
                prop_assert_ne!(effective, Mode::Charge);
            }
            if blocked.contains(DeviceKind::Inverter) {
                prop_assert_ne!(effective, Mode::Discharge);
            }
            prop_assert_eq!(solar, !blocked.contains(DeviceKind::Solar) && effective != Mode::Protect);
        }
    }

    #[test]
    fn test_effective_mode_table() {
        let charger = KindSet::of(&[DeviceKind::Charger]);
        assert_eq!(effective_mode(Mode::Charge, charger), (Mode::Idle, true));
        assert_eq!(effective_mode(Mode::Discharge, charger), (Mode::Discharge, true));
        assert_eq!(effective_mode(Mode::Protect, KindSet::empty()), (Mode::Protect, false));
        assert_eq!(effective_mode(Mode::Idle, KindSet::of(&[DeviceKind::Solar])), (Mode::Idle, false));
    }

    fn quiet() -> Arc<dyn ModeTarget> {
        let mut mock = MockModeTarget::new();
        mock.expect_set_mode().returning(|_| ());
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_transition_order_charger_solar_inverter() {
        let mut seq = Sequence::new();
        let mut charger = MockModeTarget::new();
        let mut solar = MockModeTarget::new();
        let mut inverter = MockModeTarget::new();
        charger
            .expect_set_mode()
            .with(eq(Mode::Discharge))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        solar
            .expect_set_mode()
            .with(eq(Mode::Discharge))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        inverter
            .expect_set_mode()
            .with(eq(Mode::Discharge))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());

        let switcher = ModeSwitcher::new(Arc::new(charger), Arc::new(solar), Arc::new(inverter));
        switcher.request(Mode::Discharge);
        switcher.queue().drain().await;
        assert_eq!(switcher.effective(), Mode::Discharge);
    }

    #[tokio::test]
    async fn test_lock_downshifts_charge_and_leaves_inverter() {
        let mut charger = MockModeTarget::new();
        let mut inverter = MockModeTarget::new();
        let mut seq = Sequence::new();
        charger
            .expect_set_mode()
            .with(eq(Mode::Charge))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        charger
            .expect_set_mode()
            .with(eq(Mode::Idle))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ());
        // first transition switches the inverter off, later ones leave it alone
        inverter.expect_set_mode().with(eq(Mode::Charge)).times(1).returning(|_| ());

        let switcher = ModeSwitcher::new(Arc::new(charger), quiet(), Arc::new(inverter));
        switcher.request(Mode::Charge);
        switcher.queue().drain().await;

        switcher.update_locks(KindSet::of(&[DeviceKind::Charger, DeviceKind::Solar]));
        switcher.queue().drain().await;
        assert_eq!(switcher.effective(), Mode::Idle);
        assert!(!switcher.solar_enabled());

        // unchanged lock set: nothing new
        switcher.update_locks(KindSet::of(&[DeviceKind::Charger, DeviceKind::Solar]));
        assert!(switcher.queue().is_empty());
    }

    #[tokio::test]
    async fn test_mode_changes_are_published() {
        let switcher = ModeSwitcher::new(quiet(), quiet(), quiet());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        switcher.subscribe(Arc::new(move |m: Mode| sink.lock().push(m)));

        switcher.request(Mode::Discharge);
        switcher.update_locks(KindSet::of(&[DeviceKind::Solar]));
        switcher.update_locks(KindSet::of(&[DeviceKind::Inverter]));
        switcher.on_trigger(Trigger::Every300s).unwrap();
        switcher.queue().drain().await;

        // the solar-only change transitions devices but keeps the mode
        assert_eq!(*seen.lock(), vec![Mode::Discharge, Mode::Idle, Mode::Idle]);
    }
}
