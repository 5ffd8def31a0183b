//! Host-side driver for StepManiaX dance pad controllers
//!
//! This crate finds connected pads over USB HID, keeps a connection to up to
//! two of them, and exposes their inputs, lights, and configuration:
//!
//! - a background scanner watches for pads being plugged and unplugged;
//! - a dedicated I/O thread owns all device traffic: the serial-over-HID
//!   framing, one-command-at-a-time sequencing, input reports, and the
//!   lights pacing the master controllers expect;
//! - user callbacks fire from their own worker thread, in order.
//!
//! # Architecture
//!
//! ```text
//! USB hotplug → scanner thread → slot 0/1 → I/O thread → callback worker → user
//! ```
//!
//! Everything is nonblocking from the caller's side: getters return the most
//! recent state, setters queue work for the I/O thread and return. No
//! functions return errors; operating on a pad that isn't connected simply
//! does nothing.
//!
//! ```no_run
//! use smx::{SmxManager, UpdateReason};
//!
//! let manager = SmxManager::new(|pad, reason| {
//!     if reason == UpdateReason::Updated {
//!         println!("pad {pad} changed");
//!     }
//! });
//! // ... poll manager.get_input_state(0), send manager.set_lights(...) ...
//! manager.stop();
//! ```
//!
//! Slot 0 is the player-1 pad and slot 1 the player-2 pad; the driver swaps
//! slots once devices identify themselves so this holds regardless of plug
//! order.
//!
//! Diagnostics are logged through the `log` facade; install any logger to
//! see them.

mod callback_worker;
pub mod config;
mod connection;
mod device;
mod hid;
mod lights;
mod manager;
mod packets;
mod scanner;
#[cfg(test)]
mod test_util;
mod types;

pub use callback_worker::UpdateCallback;
pub use config::{
    Config, PackedSensorSettings, CONFIG_FLAG_AUTO_LIGHTING_USE_PRESSED_ANIMATIONS,
    CONFIG_FLAG_FSR, CONFIG_PACKET_SIZE,
};
pub use hid::{DeviceSource, HidHandle, OpenedDevice, PRODUCT_ID, PRODUCT_NAME, VENDOR_ID};
pub use manager::{SmxManager, PAD_COUNT};
pub use scanner::DeviceScanner;
pub use types::{
    PanelTestMode, SensorTestData, SensorTestMode, SmxInfo, UpdateReason, PANEL_COUNT,
    SENSOR_COUNT,
};
