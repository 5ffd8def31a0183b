//! Pre-version-5 configuration packet compatibility
//!
//! Firmware 5 rearranged the configuration packet. Masters below version 5
//! still speak the old layout (also 250 bytes, different field order), so we
//! convert in both directions at the wire boundary:
//!
//! - reads from old firmware are migrated into [`Config`], with fields the
//!   old packet doesn't carry left at their defaults;
//! - writes to old firmware are applied over the raw bytes we last read from
//!   the device, so fields the new format doesn't know about survive the
//!   round trip.
//!
//! Which fields the old packet actually carries depends on its
//! `configVersion` byte (0xFF means pre-versioned).

use super::{Config, CONFIG_PACKET_SIZE};

// Byte offsets within the old packet layout.
const OLD_MASTER_DEBOUNCE_MS: usize = 6; // u16
const OLD_THRESHOLD_7: usize = 8; // low, high ("cardinal")
const OLD_THRESHOLD_4: usize = 10; // ("center")
const OLD_THRESHOLD_2: usize = 12; // ("corner")
const OLD_PANEL_DEBOUNCE_US: usize = 14; // u16
const OLD_AUTO_CALIBRATION_MAX_DEVIATION: usize = 18;
const OLD_BAD_SENSOR_MINIMUM_DELAY_S: usize = 19;
const OLD_AUTO_CALIBRATION_AVERAGES: usize = 20; // u16
const OLD_THRESHOLD_1: usize = 24; // ("up")
const OLD_ENABLED_SENSORS: usize = 26; // 5 bytes
const OLD_AUTO_LIGHTS_TIMEOUT: usize = 31;
const OLD_STEP_COLOR: usize = 32; // 27 bytes
const OLD_PANEL_ROTATION: usize = 59;
const OLD_AUTO_CALIBRATION_SAMPLES: usize = 60; // u16
const OLD_MASTER_VERSION: usize = 62;
const OLD_CONFIG_VERSION: usize = 63;
const OLD_THRESHOLD_0: usize = 74; // configVersion >= 2 from here
const OLD_THRESHOLD_3: usize = 76;
const OLD_THRESHOLD_5: usize = 78;
const OLD_THRESHOLD_6: usize = 80;
const OLD_THRESHOLD_8: usize = 82;
const OLD_DEBOUNCE_DELAY_MS: usize = 84; // u16, configVersion >= 3

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Pad an old-layout buffer out to the full packet size. The firmware
/// normally sends all 250 bytes, but short reads are tolerated; absent
/// bytes read as 0xFF (the "not set" marker).
fn padded(old_data: &[u8]) -> [u8; CONFIG_PACKET_SIZE] {
    let mut buf = [0xFFu8; CONFIG_PACKET_SIZE];
    let len = old_data.len().min(CONFIG_PACKET_SIZE);
    buf[..len].copy_from_slice(&old_data[..len]);
    buf
}

/// Migrate an old-layout packet into the current [`Config`].
///
/// Fields are copied in their order within the old packet so each
/// `configVersion` cutoff is a clean early return; anything past the cutoff
/// keeps its [`Config::default`] value.
pub fn convert_to_new(old_data: &[u8]) -> Config {
    let old = padded(old_data);
    let mut config = Config::default();

    config.debounce_nodelay_milliseconds = read_u16(&old, OLD_MASTER_DEBOUNCE_MS);

    config.panel_settings[7].load_cell_low_threshold = old[OLD_THRESHOLD_7];
    config.panel_settings[7].load_cell_high_threshold = old[OLD_THRESHOLD_7 + 1];
    config.panel_settings[4].load_cell_low_threshold = old[OLD_THRESHOLD_4];
    config.panel_settings[4].load_cell_high_threshold = old[OLD_THRESHOLD_4 + 1];
    config.panel_settings[2].load_cell_low_threshold = old[OLD_THRESHOLD_2];
    config.panel_settings[2].load_cell_high_threshold = old[OLD_THRESHOLD_2 + 1];

    config.panel_debounce_microseconds = read_u16(&old, OLD_PANEL_DEBOUNCE_US);
    config.auto_calibration_max_deviation = old[OLD_AUTO_CALIBRATION_MAX_DEVIATION];
    config.bad_sensor_minimum_delay_seconds = old[OLD_BAD_SENSOR_MINIMUM_DELAY_S];
    config.auto_calibration_averages_per_update = read_u16(&old, OLD_AUTO_CALIBRATION_AVERAGES);

    config.panel_settings[1].load_cell_low_threshold = old[OLD_THRESHOLD_1];
    config.panel_settings[1].load_cell_high_threshold = old[OLD_THRESHOLD_1 + 1];

    config
        .enabled_sensors
        .copy_from_slice(&old[OLD_ENABLED_SENSORS..OLD_ENABLED_SENSORS + 5]);
    config.auto_lights_timeout = old[OLD_AUTO_LIGHTS_TIMEOUT];
    config
        .step_color
        .copy_from_slice(&old[OLD_STEP_COLOR..OLD_STEP_COLOR + 27]);
    config.panel_rotation = old[OLD_PANEL_ROTATION];
    config.auto_calibration_samples_per_average = read_u16(&old, OLD_AUTO_CALIBRATION_SAMPLES);

    if old[OLD_CONFIG_VERSION] == 0xFF {
        return config;
    }

    config.master_version = old[OLD_MASTER_VERSION];
    config.config_version = old[OLD_CONFIG_VERSION];

    if old[OLD_CONFIG_VERSION] < 2 {
        return config;
    }

    for (panel, offset) in [
        (0, OLD_THRESHOLD_0),
        (3, OLD_THRESHOLD_3),
        (5, OLD_THRESHOLD_5),
        (6, OLD_THRESHOLD_6),
        (8, OLD_THRESHOLD_8),
    ] {
        config.panel_settings[panel].load_cell_low_threshold = old[offset];
        config.panel_settings[panel].load_cell_high_threshold = old[offset + 1];
    }

    if old[OLD_CONFIG_VERSION] < 3 {
        return config;
    }

    config.debounce_delay_milliseconds = read_u16(&old, OLD_DEBOUNCE_DELAY_MS);

    config
}

/// Write a [`Config`] into an old-layout buffer.
///
/// `old_data` holds the raw bytes we're replacing (normally the packet we
/// last read from this device). Fields that exist in the old format and not
/// the new one are left unchanged, so they round-trip back to the pad.
pub fn convert_to_old(config: &Config, old_data: &mut Vec<u8>) {
    // It's safe to set every field in the output packet regardless of its
    // configVersion. If the buffer is short, extend it first.
    if old_data.len() < CONFIG_PACKET_SIZE {
        old_data.resize(CONFIG_PACKET_SIZE, 0xFF);
    }
    let old = &mut old_data[..];

    write_u16(old, OLD_MASTER_DEBOUNCE_MS, config.debounce_nodelay_milliseconds);

    old[OLD_THRESHOLD_7] = config.panel_settings[7].load_cell_low_threshold;
    old[OLD_THRESHOLD_7 + 1] = config.panel_settings[7].load_cell_high_threshold;
    old[OLD_THRESHOLD_4] = config.panel_settings[4].load_cell_low_threshold;
    old[OLD_THRESHOLD_4 + 1] = config.panel_settings[4].load_cell_high_threshold;
    old[OLD_THRESHOLD_2] = config.panel_settings[2].load_cell_low_threshold;
    old[OLD_THRESHOLD_2 + 1] = config.panel_settings[2].load_cell_high_threshold;

    write_u16(old, OLD_PANEL_DEBOUNCE_US, config.panel_debounce_microseconds);
    old[OLD_AUTO_CALIBRATION_MAX_DEVIATION] = config.auto_calibration_max_deviation;
    old[OLD_BAD_SENSOR_MINIMUM_DELAY_S] = config.bad_sensor_minimum_delay_seconds;
    write_u16(old, OLD_AUTO_CALIBRATION_AVERAGES, config.auto_calibration_averages_per_update);

    old[OLD_THRESHOLD_1] = config.panel_settings[1].load_cell_low_threshold;
    old[OLD_THRESHOLD_1 + 1] = config.panel_settings[1].load_cell_high_threshold;

    old[OLD_ENABLED_SENSORS..OLD_ENABLED_SENSORS + 5].copy_from_slice(&config.enabled_sensors);
    old[OLD_AUTO_LIGHTS_TIMEOUT] = config.auto_lights_timeout;
    old[OLD_STEP_COLOR..OLD_STEP_COLOR + 27].copy_from_slice(&config.step_color);
    old[OLD_PANEL_ROTATION] = config.panel_rotation;
    write_u16(old, OLD_AUTO_CALIBRATION_SAMPLES, config.auto_calibration_samples_per_average);

    old[OLD_MASTER_VERSION] = config.master_version;
    old[OLD_CONFIG_VERSION] = config.config_version;

    for (panel, offset) in [
        (0, OLD_THRESHOLD_0),
        (3, OLD_THRESHOLD_3),
        (5, OLD_THRESHOLD_5),
        (6, OLD_THRESHOLD_6),
        (8, OLD_THRESHOLD_8),
    ] {
        old[offset] = config.panel_settings[panel].load_cell_low_threshold;
        old[offset + 1] = config.panel_settings[panel].load_cell_high_threshold;
    }

    write_u16(old, OLD_DEBOUNCE_DELAY_MS, config.debounce_delay_milliseconds);
}
