//! Residential battery energy controller.
//!
//! Coordinates chargers, inverters, solar chargers, heaters and battery
//! BMSs behind one operator mode, guarded by a supervisor of prioritised
//! lock reasons, and publishes the resulting state over MQTT.

pub mod clock;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod io;
pub mod telemetry;
