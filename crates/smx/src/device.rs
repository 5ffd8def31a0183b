//! Per-slot device state machine
//!
//! Sits on top of [`Connection`] and drives one pad through its lifecycle:
//! once the info reply arrives the connection is activated and the stored
//! configuration is requested; once that's read back the device counts as
//! connected. From then on each tick services coalesced config writes,
//! sensor test polling, and inbound packets.
//!
//! The lifecycle is tracked with flags rather than an explicit state value,
//! the stages being: closed (no handle), awaiting info (open, no info yet),
//! awaiting config (info read, `have_config` false), and ready.

use std::time::Instant;

use hidapi::HidResult;

use crate::config::{legacy, Config, CONFIG_PACKET_SIZE, FLAGS_OFFSET};
use crate::connection::{CommandCallback, Connection};
use crate::hid::HidHandle;
use crate::sensor_test;
use crate::types::{SensorTestData, SensorTestMode, SmxInfo, UpdateReason};

/// How long to wait for a sensor test reply before assuming the request was
/// lost and re-sending it.
const SENSOR_TEST_RETRY_MS: u128 = 2000;

/// One device slot: protocol state plus the cached device data the public
/// getters serve.
#[derive(Default)]
pub(crate) struct Device {
    pub connection: Connection,

    /// The configuration we last read from (or acknowledged to) the device.
    config: Config,
    /// The raw old-layout bytes the config came from, kept so a write to
    /// old firmware preserves bytes the new format doesn't carry.
    raw_config: Vec<u8>,
    have_config: bool,

    /// The configuration the caller asked for. Sent to the device when
    /// `send_config` is set; only the most recent request survives.
    wanted_config: Config,
    send_config: bool,
    sending_config: bool,
    awaiting_config_response: bool,

    sensor_test_mode: SensorTestMode,
    /// The mode of the outstanding sensor test request, or `Off` if none.
    waiting_for_sensor_response: SensorTestMode,
    sent_sensor_request_at: Option<Instant>,
    have_test_data: bool,
    test_data: SensorTestData,

    /// Input mask we last reported to the user, for change detection.
    last_reported_input: u16,
}

impl Device {
    /// Begin using a newly opened handle for this slot.
    pub fn open(&mut self) {
        self.connection.open();
    }

    /// Drop the device. Queued command completions are still delivered via
    /// `connection.take_completed`.
    pub fn close(&mut self) {
        self.connection.close();
        self.have_config = false;
        self.send_config = false;
        self.sending_config = false;
        self.awaiting_config_response = false;
        self.raw_config.clear();
        self.waiting_for_sensor_response = SensorTestMode::Off;
        self.sent_sensor_request_at = None;
        self.have_test_data = false;
        self.last_reported_input = 0;
    }

    /// A device isn't exposed as connected until its configuration has been
    /// read, so callers never observe a half-initialized pad.
    pub fn is_connected(&self) -> bool {
        self.connection.has_info() && self.have_config
    }

    pub fn get_info(&self) -> SmxInfo {
        if !self.is_connected() {
            return SmxInfo::default();
        }
        SmxInfo {
            connected: true,
            serial: self.connection.info().serial.clone(),
            firmware_version: self.connection.info().firmware_version,
        }
    }

    pub fn is_player2(&self) -> bool {
        self.is_connected() && self.connection.info().player2
    }

    pub fn input_state(&self) -> u16 {
        self.connection.input_state()
    }

    /// The current configuration. If a write is pending, this returns the
    /// value being written, so a `set_config` immediately followed by
    /// `get_config` observes the new value without waiting for the wire.
    pub fn get_config(&self) -> Option<Config> {
        if !self.have_config {
            return None;
        }
        Some(if self.send_config {
            self.wanted_config
        } else {
            self.config
        })
    }

    pub fn set_config(&mut self, config: Config) {
        self.wanted_config = config;
        self.send_config = true;
    }

    /// Queue a raw command (used by the manager for lights and test modes).
    pub fn send_command(&mut self, cmd: &[u8], callback: Option<CommandCallback>) {
        self.connection.send_command(cmd, callback);
    }

    /// Reset the pad's stored configuration, then read it back. Completion
    /// is reported with a `FactoryResetCommandComplete` callback.
    pub fn factory_reset(&mut self) {
        if !self.connection.is_open() {
            return;
        }
        self.connection.send_command(b"f\n", None);
        self.connection
            .send_command(self.config_read_command(), Some(CommandCallback::FactoryResetReadDone));
    }

    /// Force an immediate recalibration, the same one that happens at boot.
    pub fn force_recalibration(&mut self) {
        self.connection.send_command(b"C\n", None);
    }

    pub fn set_sensor_test_mode(&mut self, mode: SensorTestMode) {
        self.sensor_test_mode = mode;
    }

    pub fn sensor_test_mode(&self) -> SensorTestMode {
        self.sensor_test_mode
    }

    pub fn get_test_data(&self) -> Option<SensorTestData> {
        if !self.have_test_data {
            return None;
        }
        Some(self.test_data.clone())
    }

    /// Service this slot: drive the connection lifecycle, flush a coalesced
    /// config write, poll sensor test mode, and parse inbound packets.
    /// Returns the user callbacks this tick produced. A transport error
    /// means the slot must be closed by the caller.
    pub fn update(&mut self, handle: &mut dyn HidHandle, now: Instant) -> HidResult<Vec<UpdateReason>> {
        let mut events = Vec::new();

        if !self.connection.is_open() {
            return Ok(events);
        }

        self.check_active();
        self.send_config_if_needed();
        self.update_sensor_test(now);

        self.connection.update(handle)?;

        // Reports are also fed in between ticks, so compare against what we
        // last told the user rather than a snapshot from this call.
        if self.last_reported_input != self.connection.input_state() {
            self.last_reported_input = self.connection.input_state();
            events.push(UpdateReason::Updated);
        }

        self.handle_packets(&mut events);
        Ok(events)
    }

    /// React to a finished command.
    pub fn handle_completion(&mut self, tag: CommandCallback, events: &mut Vec<UpdateReason>) {
        match tag {
            CommandCallback::ConfigWriteDone => self.sending_config = false,
            CommandCallback::ConfigReadbackDone => self.awaiting_config_response = false,
            CommandCallback::FactoryResetReadDone => {
                // The reset configuration has been read back.
                events.push(UpdateReason::FactoryResetCommandComplete);
            }
            // Lights completions belong to the manager's scheduler.
            CommandCallback::LightsSent => {}
        }
    }

    /// Once the device has identified itself, take ownership of the
    /// connection and request the stored configuration.
    fn check_active(&mut self) {
        if !self.connection.has_info() || self.connection.is_active() {
            return;
        }
        self.connection.set_active(true);
        self.connection.send_command(self.config_read_command(), None);
    }

    /// Firmware 5 renamed the config commands so old tools don't
    /// misinterpret the new packet format.
    fn config_read_command(&self) -> &'static [u8] {
        if self.connection.info().firmware_version >= 5 {
            b"G"
        } else {
            b"g\n"
        }
    }

    /// Send `wanted_config` if a write is due. Writes are coalesced: while
    /// one is on the wire (or its read-back is outstanding) nothing new is
    /// sent, so a burst of `set_config` calls produces one write of the
    /// latest value.
    fn send_config_if_needed(&mut self) {
        if !self.connection.is_open() || !self.send_config || self.sending_config {
            return;
        }

        // We can't write until we've read the device's previous
        // configuration, and we hold off while a read-back is pending.
        if !self.have_config || self.awaiting_config_response {
            return;
        }

        let firmware = self.connection.info().firmware_version;
        let payload = if firmware >= 5 {
            self.wanted_config.to_bytes().to_vec()
        } else {
            // Old firmware speaks the old layout. Write over the raw bytes
            // we last read so unknown fields round-trip.
            legacy::convert_to_old(&self.wanted_config, &mut self.raw_config);
            self.raw_config.clone()
        };

        // Firmware through version 3 rejects oversized config packets, so
        // truncate the write for those devices.
        let mut size = CONFIG_PACKET_SIZE;
        if self.config.master_version <= 3 {
            size = size.min(FLAGS_OFFSET);
        }

        let mut data = Vec::with_capacity(2 + size);
        data.push(if firmware >= 5 { b'W' } else { b'w' });
        data.push(size as u8);
        data.extend_from_slice(&payload[..size]);

        // Don't send another config until this one finishes, so a burst of
        // updates doesn't spam the device, which can get slow.
        self.sending_config = true;
        self.connection
            .send_command(&data, Some(CommandCallback::ConfigWriteDone));
        self.send_config = false;

        // Assume the configuration is what we just sent, so get_config
        // keeps returning it instead of the stale value until the
        // read-back below completes.
        self.config = self.wanted_config;

        self.awaiting_config_response = true;
        self.connection
            .send_command(self.config_read_command(), Some(CommandCallback::ConfigReadbackDone));
    }

    /// Re-request sensor test data if a mode is active. The reply should be
    /// quick; if one doesn't arrive for a while, assume the request was
    /// lost and send another.
    fn update_sensor_test(&mut self, now: Instant) {
        let Some(mode_byte) = self.sensor_test_mode.mode_byte() else {
            return;
        };

        if self.waiting_for_sensor_response != SensorTestMode::Off {
            let waited = self
                .sent_sensor_request_at
                .map(|at| now.duration_since(at).as_millis())
                .unwrap_or(0);
            if waited < SENSOR_TEST_RETRY_MS {
                return;
            }
        }

        self.waiting_for_sensor_response = self.sensor_test_mode;
        self.sent_sensor_request_at = Some(now);
        self.connection
            .send_command(&[b'y', mode_byte, b'\n'], None);
    }

    fn handle_packets(&mut self, events: &mut Vec<UpdateReason>) {
        while let Some(packet) = self.connection.read_packet() {
            match packet.first().copied() {
                Some(b'y') => self.handle_sensor_test_reply(&packet, events),
                // 'g' is sent by firmware 1-4; 5 and newer send 'G' so
                // older code doesn't misread the new packet format.
                Some(b'g') | Some(b'G') => self.handle_config_reply(&packet, events),
                _ => {}
            }
        }
    }

    fn handle_config_reply(&mut self, packet: &[u8], events: &mut Vec<UpdateReason>) {
        if packet.len() < 2 {
            log::warn!("Communication error: invalid configuration packet");
            return;
        }
        let size = packet[1] as usize;
        if packet.len() < size + 2 {
            log::warn!("Communication error: invalid configuration packet");
            return;
        }
        let payload = &packet[2..2 + size];

        if self.connection.info().firmware_version >= 5 {
            self.config = Config::from_bytes(payload);
        } else {
            self.raw_config = payload.to_vec();
            self.config = legacy::convert_to_new(payload);
        }
        self.have_config = true;

        events.push(UpdateReason::Updated);
    }

    /// Decode a `y` reply: mode byte, word count, then the bit-planed words
    /// (see [`sensor_test`]).
    fn handle_sensor_test_reply(&mut self, packet: &[u8], events: &mut Vec<UpdateReason>) {
        if packet.len() < 3 {
            return;
        }
        let size = packet[2] as usize * 2;
        if packet.len() < size + 3 {
            return;
        }

        let mode = SensorTestMode::from_mode_byte(packet[1]);
        let words: Vec<u16> = packet[3..3 + size]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        if self.waiting_for_sensor_response == SensorTestMode::Off {
            log::info!(
                "Ignoring unexpected sensor data response. It may have been sent by another application."
            );
            return;
        }

        if mode != Some(self.waiting_for_sensor_response) {
            log::info!(
                "Ignoring unexpected sensor data response (got {:?}, expected {:?})",
                mode,
                self.waiting_for_sensor_response
            );
            return;
        }

        self.waiting_for_sensor_response = SensorTestMode::Off;

        // The reply matches the request we most recently sent. If the user
        // changed modes while it was in the air, just drop it.
        if mode != Some(self.sensor_test_mode) {
            return;
        }

        self.test_data = sensor_test::decode_reply(&words, &self.test_data);
        self.have_test_data = true;
        events.push(UpdateReason::Updated);
    }
}
