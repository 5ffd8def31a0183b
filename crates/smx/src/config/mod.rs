//! The pad configuration record
//!
//! The configuration is stored on the master controller as a packed 250-byte
//! record, read back with the `g`/`G` command and written with `w`/`W`. The
//! field order here matches the byte order of that packet and must not be
//! changed. Serialization is done with explicit offset reads and writes
//! rather than transmuting a struct, so the wire layout is independent of
//! anything the compiler decides.
//!
//! Firmware version 5 changed the packet format; the previous layout and the
//! migration between the two live in [`legacy`].

pub mod legacy;

use crate::types::{PANEL_COUNT, SENSOR_COUNT};

/// Total size of the configuration packet. The record is padded to keep this
/// from changing as fields are added.
pub const CONFIG_PACKET_SIZE: usize = 250;

/// Byte offset of [`Config::flags`] in the serialized packet. Config writes
/// to masters at version 3 and below are truncated to this offset.
pub(crate) const FLAGS_OFFSET: usize = 2;

/// Byte offset of the trailing padding in the serialized packet.
const PADDING_OFFSET: usize = 201;

/// If set, panels use the pressed animation when pressed, and `step_color`
/// is ignored. If unset, panels are lit solid using `step_color`.
/// Master version 4 and up; earlier versions always use `step_color`.
pub const CONFIG_FLAG_AUTO_LIGHTING_USE_PRESSED_ANIMATIONS: u8 = 1 << 0;

/// If set, panels are using FSRs, otherwise load cells.
pub const CONFIG_FLAG_FSR: u8 = 1 << 1;

/// Per-panel sensor thresholds, packed as 16 bytes per panel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackedSensorSettings {
    /// Load cell thresholds.
    pub load_cell_low_threshold: u8,
    pub load_cell_high_threshold: u8,

    /// FSR thresholds, one per sensor.
    pub fsr_low_threshold: [u8; SENSOR_COUNT],
    pub fsr_high_threshold: [u8; SENSOR_COUNT],

    pub combined_low_threshold: u16,
    pub combined_high_threshold: u16,

    /// This must be left unchanged.
    pub reserved: u16,
}

/// Size of one serialized [`PackedSensorSettings`].
const SENSOR_SETTINGS_SIZE: usize = 16;

impl PackedSensorSettings {
    fn write(&self, out: &mut [u8]) {
        out[0] = self.load_cell_low_threshold;
        out[1] = self.load_cell_high_threshold;
        out[2..6].copy_from_slice(&self.fsr_low_threshold);
        out[6..10].copy_from_slice(&self.fsr_high_threshold);
        out[10..12].copy_from_slice(&self.combined_low_threshold.to_le_bytes());
        out[12..14].copy_from_slice(&self.combined_high_threshold.to_le_bytes());
        out[14..16].copy_from_slice(&self.reserved.to_le_bytes());
    }

    fn read(data: &[u8]) -> PackedSensorSettings {
        PackedSensorSettings {
            load_cell_low_threshold: data[0],
            load_cell_high_threshold: data[1],
            fsr_low_threshold: [data[2], data[3], data[4], data[5]],
            fsr_high_threshold: [data[6], data[7], data[8], data[9]],
            combined_low_threshold: u16::from_le_bytes([data[10], data[11]]),
            combined_high_threshold: u16::from_le_bytes([data[12], data[13]]),
            reserved: u16::from_le_bytes([data[14], data[15]]),
        }
    }
}

/// The configuration for a connected controller.
///
/// Retrieved with `SmxManager::get_config` and modified with
/// `SmxManager::set_config`. Applications should change only the fields they
/// mean to and leave everything else (including `padding`) untouched, so
/// unknown data round-trips back to the pad.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The firmware version of the master controller. Where supported
    /// (version 2 and up) this always reads back the firmware version; on
    /// version 1 it stays 0xFF.
    pub master_version: u8,

    /// The version of this config packet, which tells the firmware which
    /// fields have been filled in. Unset fields read 0xFF. This is unrelated
    /// to the firmware version.
    ///
    /// Versions:
    /// - 0xFF: from before `config_version` was added
    /// - 0x00: `config_version` added
    /// - 0x02: per-panel thresholds for panels 0,3,5,6,8 added
    /// - 0x03: `debounce_delay_milliseconds` added
    pub config_version: u8,

    /// Packed [`CONFIG_FLAG_AUTO_LIGHTING_USE_PRESSED_ANIMATIONS`] /
    /// [`CONFIG_FLAG_FSR`] bits (master version 4 and up).
    pub flags: u8,

    // These are internal tunables and should be left unchanged.
    pub debounce_nodelay_milliseconds: u16,
    pub debounce_delay_milliseconds: u16,
    pub panel_debounce_microseconds: u16,
    pub auto_calibration_max_deviation: u8,
    pub bad_sensor_minimum_delay_seconds: u8,
    pub auto_calibration_averages_per_update: u16,
    pub auto_calibration_samples_per_average: u16,

    /// The maximum tare value to calibrate to (except on startup).
    pub auto_calibration_max_tare: u16,

    /// Which sensors on each panel to enable. Packed with four sensors on
    /// two pads per byte: `enabled_sensors[0] & 1` is the first sensor on
    /// the first panel, and so on.
    pub enabled_sensors: [u8; 5],

    /// How long the master controller waits for a lights command before
    /// assuming the host has gone away and resuming auto-lights, in 128 ms
    /// units.
    pub auto_lights_timeout: u8,

    /// The color to use for each panel when auto-lighting in master mode,
    /// three bytes per panel. These colors should be scaled to the 0-170
    /// range.
    pub step_color: [u8; 3 * PANEL_COUNT],

    /// The default color to set the platform LED strip to.
    pub platform_strip_color: [u8; 3],

    /// Which panels to enable auto-lighting for: 0x01 = panel 0, 0x02 =
    /// panel 1, and so on. Only affects the master's built-in auto lighting,
    /// not lights sent by this library.
    pub auto_light_panel_mask: u16,

    /// The rotation of the panel: 0 standard, 1 rotated right 90 degrees,
    /// 2 rotated 180, 3 rotated 270. Unused by current firmware.
    pub panel_rotation: u8,

    /// Per-panel sensor thresholds.
    pub panel_settings: [PackedSensorSettings; PANEL_COUNT],

    // Internal tunable, leave unchanged.
    pub pre_details_delay_milliseconds: u8,

    /// Pads the packet to 250 bytes. Leave any data in here unchanged.
    pub padding: [u8; 49],
}

impl Default for Config {
    fn default() -> Self {
        Config {
            master_version: 0xFF,
            config_version: 0x05,
            flags: 0,
            debounce_nodelay_milliseconds: 0,
            debounce_delay_milliseconds: 0,
            panel_debounce_microseconds: 4000,
            auto_calibration_max_deviation: 100,
            bad_sensor_minimum_delay_seconds: 15,
            auto_calibration_averages_per_update: 60,
            auto_calibration_samples_per_average: 500,
            auto_calibration_max_tare: 0xFFFF,
            enabled_sensors: [0; 5],
            auto_lights_timeout: (1000 / 128) as u8,
            step_color: [0; 3 * PANEL_COUNT],
            platform_strip_color: [0; 3],
            auto_light_panel_mask: 0xFFFF,
            panel_rotation: 0,
            panel_settings: [PackedSensorSettings::default(); PANEL_COUNT],
            pre_details_delay_milliseconds: 5,
            padding: [0; 49],
        }
    }
}

impl Config {
    /// Serialize to the 250-byte wire format.
    pub fn to_bytes(&self) -> [u8; CONFIG_PACKET_SIZE] {
        let mut out = [0u8; CONFIG_PACKET_SIZE];
        out[0] = self.master_version;
        out[1] = self.config_version;
        out[2] = self.flags;
        out[3..5].copy_from_slice(&self.debounce_nodelay_milliseconds.to_le_bytes());
        out[5..7].copy_from_slice(&self.debounce_delay_milliseconds.to_le_bytes());
        out[7..9].copy_from_slice(&self.panel_debounce_microseconds.to_le_bytes());
        out[9] = self.auto_calibration_max_deviation;
        out[10] = self.bad_sensor_minimum_delay_seconds;
        out[11..13].copy_from_slice(&self.auto_calibration_averages_per_update.to_le_bytes());
        out[13..15].copy_from_slice(&self.auto_calibration_samples_per_average.to_le_bytes());
        out[15..17].copy_from_slice(&self.auto_calibration_max_tare.to_le_bytes());
        out[17..22].copy_from_slice(&self.enabled_sensors);
        out[22] = self.auto_lights_timeout;
        out[23..50].copy_from_slice(&self.step_color);
        out[50..53].copy_from_slice(&self.platform_strip_color);
        out[53..55].copy_from_slice(&self.auto_light_panel_mask.to_le_bytes());
        out[55] = self.panel_rotation;
        for (i, panel) in self.panel_settings.iter().enumerate() {
            let offset = 56 + i * SENSOR_SETTINGS_SIZE;
            panel.write(&mut out[offset..offset + SENSOR_SETTINGS_SIZE]);
        }
        out[200] = self.pre_details_delay_milliseconds;
        out[PADDING_OFFSET..].copy_from_slice(&self.padding);
        out
    }

    /// Parse from wire bytes. A short buffer is allowed: missing trailing
    /// fields keep their defaults, matching how the firmware reports
    /// truncated packets.
    pub fn from_bytes(data: &[u8]) -> Config {
        let mut buf = Config::default().to_bytes();
        let len = data.len().min(CONFIG_PACKET_SIZE);
        buf[..len].copy_from_slice(&data[..len]);

        let mut panel_settings = [PackedSensorSettings::default(); PANEL_COUNT];
        for (i, panel) in panel_settings.iter_mut().enumerate() {
            let offset = 56 + i * SENSOR_SETTINGS_SIZE;
            *panel = PackedSensorSettings::read(&buf[offset..offset + SENSOR_SETTINGS_SIZE]);
        }

        let mut enabled_sensors = [0u8; 5];
        enabled_sensors.copy_from_slice(&buf[17..22]);
        let mut step_color = [0u8; 3 * PANEL_COUNT];
        step_color.copy_from_slice(&buf[23..50]);
        let mut padding = [0u8; 49];
        padding.copy_from_slice(&buf[PADDING_OFFSET..]);

        Config {
            master_version: buf[0],
            config_version: buf[1],
            flags: buf[2],
            debounce_nodelay_milliseconds: u16::from_le_bytes([buf[3], buf[4]]),
            debounce_delay_milliseconds: u16::from_le_bytes([buf[5], buf[6]]),
            panel_debounce_microseconds: u16::from_le_bytes([buf[7], buf[8]]),
            auto_calibration_max_deviation: buf[9],
            bad_sensor_minimum_delay_seconds: buf[10],
            auto_calibration_averages_per_update: u16::from_le_bytes([buf[11], buf[12]]),
            auto_calibration_samples_per_average: u16::from_le_bytes([buf[13], buf[14]]),
            auto_calibration_max_tare: u16::from_le_bytes([buf[15], buf[16]]),
            enabled_sensors,
            auto_lights_timeout: buf[22],
            step_color,
            platform_strip_color: [buf[50], buf[51], buf[52]],
            auto_light_panel_mask: u16::from_le_bytes([buf[53], buf[54]]),
            panel_rotation: buf[55],
            panel_settings,
            pre_details_delay_milliseconds: buf[200],
            padding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_size_and_offsets() {
        let mut config = Config::default();
        config.master_version = 0x11;
        config.config_version = 0x22;
        config.flags = 0x33;
        config.panel_rotation = 0x44;
        config.pre_details_delay_milliseconds = 0x55;
        config.padding[0] = 0x66;

        let bytes = config.to_bytes();
        assert_eq!(bytes.len(), CONFIG_PACKET_SIZE);
        assert_eq!(bytes[0], 0x11);
        assert_eq!(bytes[1], 0x22);
        assert_eq!(bytes[FLAGS_OFFSET], 0x33);
        assert_eq!(bytes[55], 0x44);
        assert_eq!(bytes[200], 0x55);
        assert_eq!(bytes[PADDING_OFFSET], 0x66);
    }

    #[test]
    fn test_panel_settings_offsets() {
        let mut config = Config::default();
        config.panel_settings[0].load_cell_low_threshold = 0xAB;
        config.panel_settings[8].reserved = 0x1234;

        let bytes = config.to_bytes();
        // Panel settings start at offset 56, 16 bytes each.
        assert_eq!(bytes[56], 0xAB);
        assert_eq!(bytes[56 + 8 * 16 + 14], 0x34);
        assert_eq!(bytes[56 + 8 * 16 + 15], 0x12);
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.master_version = 5;
        config.config_version = 5;
        config.flags = CONFIG_FLAG_FSR;
        config.debounce_delay_milliseconds = 25;
        config.auto_calibration_max_tare = 0x1234;
        config.enabled_sensors = [0x0F, 0xF0, 0xAA, 0x55, 0x01];
        config.step_color[13] = 200;
        config.platform_strip_color = [10, 20, 30];
        config.auto_light_panel_mask = 0x01FF;
        for (i, panel) in config.panel_settings.iter_mut().enumerate() {
            panel.load_cell_low_threshold = i as u8;
            panel.fsr_high_threshold = [1, 2, 3, 4];
            panel.combined_high_threshold = 300 + i as u16;
        }
        config.padding[48] = 0x99;

        let parsed = Config::from_bytes(&config.to_bytes());
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_short_packet_keeps_defaults() {
        // A truncated packet only overrides the fields it carries.
        let mut config = Config::default();
        config.master_version = 3;
        config.config_version = 2;
        let bytes = config.to_bytes();

        let parsed = Config::from_bytes(&bytes[..16]);
        assert_eq!(parsed.master_version, 3);
        assert_eq!(parsed.config_version, 2);
        // Beyond the truncation point, defaults survive.
        assert_eq!(parsed.auto_calibration_max_tare, 0xFFFF);
        assert_eq!(parsed.auto_lights_timeout, (1000 / 128) as u8);
    }

    #[test]
    fn test_default_matches_firmware_defaults() {
        let config = Config::default();
        assert_eq!(config.master_version, 0xFF);
        assert_eq!(config.config_version, 0x05);
        assert_eq!(config.panel_debounce_microseconds, 4000);
        assert_eq!(config.auto_calibration_samples_per_average, 500);
        assert_eq!(config.auto_light_panel_mask, 0xFFFF);
        assert_eq!(config.pre_details_delay_milliseconds, 5);
    }
}
