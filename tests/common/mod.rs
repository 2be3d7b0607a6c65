#![allow(dead_code)]
//! Fakes shared by the scenario tests.

use async_trait::async_trait;
use bess_controller::config::Config;
use bess_controller::controller::checkers::{LinkStatus, PackSource};
use bess_controller::controller::ModeTarget;
use bess_controller::domain::{BatteryPack, DeviceKind, Mode};
use bess_controller::io::Display;
use figment::providers::{Format, Toml};
use figment::Figment;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub fn config(extra: &str) -> Config {
    let toml = format!(
        r#"
        [mqtt]
        host = "localhost"
        root = "bess"
        live_consumption_topic = "meter/grid"

        {extra}
        "#
    );
    Config::from_figment(Figment::new().merge(Toml::string(&toml))).expect("test config")
}

/// 16 cells at 3.3 V, valid as long as `c` is sane
pub fn pack(name: &str, c: f32) -> BatteryPack {
    let mut pack = BatteryPack::captured(name);
    pack.cells = vec![3.3; 16];
    pack.v = 52.8;
    pack.i = -2.0;
    pack.soc = 60.0;
    pack.c = c;
    pack.c_full = 100.0;
    pack.n = 42;
    pack.temps = vec![18.0, 19.5];
    pack
}

/// Records every `set_mode` call with the class it was addressed to
pub struct Recorder {
    kind: DeviceKind,
    calls: Arc<Mutex<Vec<(DeviceKind, Mode)>>>,
}

impl Recorder {
    pub fn new(kind: DeviceKind, calls: Arc<Mutex<Vec<(DeviceKind, Mode)>>>) -> Arc<Self> {
        Arc::new(Self { kind, calls })
    }
}

#[async_trait]
impl ModeTarget for Recorder {
    async fn set_mode(&self, mode: Mode) {
        self.calls.lock().push((self.kind, mode));
    }
}

/// Pack source with settable cell extremes
#[derive(Default)]
pub struct FakePacks {
    pub extremes: Mutex<Option<(f32, f32)>>,
}

impl PackSource for FakePacks {
    fn oldest_pack_age(&self, _now: Instant) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn cell_extremes(&self) -> Option<(f32, f32)> {
        *self.extremes.lock()
    }
}

/// Broker link whose outage start is set by the test
#[derive(Default)]
pub struct FakeLink {
    pub down_since: Mutex<Option<Instant>>,
}

impl LinkStatus for FakeLink {
    fn disconnected_since(&self) -> Option<Instant> {
        *self.down_since.lock()
    }
}

/// Display that keeps what it was asked to show
#[derive(Default)]
pub struct RecordingDisplay {
    pub capacity: Mutex<Vec<f32>>,
    pub locks: Mutex<Vec<String>>,
}

impl Display for RecordingDisplay {
    fn show_lock(&self, lock: &str) {
        self.locks.lock().push(lock.to_string());
    }

    fn show_capacity(&self, ah: f32) {
        self.capacity.lock().push(ah);
    }

    fn show_power(&self, _watts: i32) {}

    fn show_mode(&self, _mode: Mode) {}
}
