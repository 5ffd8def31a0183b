//! Per-slot I/O engine
//!
//! Owns the protocol state for one open device: the FIFO of commands waiting
//! to go out, the single in-flight command, the reassembly buffer for framed
//! replies, the queue of completed replies, and the current input mask.
//!
//! Only one command is ever in flight. Its frames are written back to back,
//! and the next command isn't started until the device says the previous one
//! finished (or, for device-info requests, until the info reply arrives).
//!
//! A connection starts out inactive: framed payloads other than device info
//! are ignored so that two processes sharing a device don't corrupt each
//! other's exchanges. The state machine activates the connection once it has
//! identified the device.

use std::collections::VecDeque;

use hidapi::HidResult;

use crate::hid::HidHandle;
use crate::packets::{
    self, Report, FLAG_DEVICE_INFO, FLAG_END_OF_COMMAND, FLAG_HOST_CMD_FINISHED,
    REPORT_ID_INPUT, REPORT_ID_SERIAL, REPORT_SIZE,
};

/// What to do when a queued command completes. Dispatched by the manager
/// under its lock; commands with no tag complete silently.
///
/// Completion is guaranteed: if the device closes with commands still
/// queued, their tags are delivered anyway so counters don't wedge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandCallback {
    /// A scheduled lights command went out; the scheduler may release the
    /// next one.
    LightsSent,
    /// The config write was consumed; another write may be coalesced out.
    ConfigWriteDone,
    /// The post-write config read-back finished.
    ConfigReadbackDone,
    /// The config read issued by a factory reset finished; the user gets a
    /// FactoryResetCommandComplete callback.
    FactoryResetReadDone,
}

/// Basic info reported by the device's info reply.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceInfo {
    /// True if this controller is set to player 2.
    pub player2: bool,
    /// Serial number as 32 lowercase hex characters.
    pub serial: String,
    pub firmware_version: u16,
}

struct PendingCommand {
    frames: Vec<Report>,
    callback: Option<CommandCallback>,
    /// Device-info requests are special: they're answerable while inactive,
    /// and they complete on the info reply rather than on the
    /// host-command-finished flag.
    is_device_info: bool,
}

/// Protocol state for one device slot. The HID handle itself is owned by
/// the I/O thread and passed in for [`Connection::update`].
#[derive(Default)]
pub(crate) struct Connection {
    open: bool,
    active: bool,
    got_info: bool,
    info: DeviceInfo,
    input_state: u16,

    pending: VecDeque<PendingCommand>,
    current: Option<PendingCommand>,

    /// Reassembly buffer for the framed reply in progress.
    assembly: Vec<u8>,
    /// Fully reassembled replies, oldest first.
    packets: VecDeque<Vec<u8>>,

    /// Completion tags that fired since the manager last drained them.
    completed: Vec<CommandCallback>,
}

impl Connection {
    /// Begin using a newly opened handle. Queues the device info request;
    /// nothing else is sent until the state machine activates us.
    pub fn open(&mut self) {
        self.reset();
        self.open = true;
        self.pending.push_back(PendingCommand {
            frames: vec![packets::device_info_request()],
            callback: None,
            is_device_info: true,
        });
    }

    /// Drop all connection state. Completion tags for anything still queued
    /// are delivered on the next drain.
    pub fn close(&mut self) {
        log::info!("Closing device");
        let unfinished: Vec<CommandCallback> = self
            .current
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .filter_map(|cmd| cmd.callback)
            .collect();
        let mut completed = std::mem::take(&mut self.completed);
        completed.extend(unfinished);
        self.reset();
        self.completed = completed;
    }

    fn reset(&mut self) {
        *self = Connection::default();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// True once the device info reply has been parsed.
    pub fn has_info(&self) -> bool {
        self.open && self.got_info
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn input_state(&self) -> u16 {
        self.input_state
    }

    /// Queue a complete command for transmission. Must be a single whole
    /// command; partial writes and multiple commands per call aren't
    /// allowed. On a closed connection the completion tag fires immediately.
    pub fn send_command(&mut self, cmd: &[u8], callback: Option<CommandCallback>) {
        if !self.open {
            if let Some(tag) = callback {
                self.completed.push(tag);
            }
            return;
        }

        self.pending.push_back(PendingCommand {
            frames: packets::split_command(cmd),
            callback,
            is_device_info: false,
        });
    }

    /// Pop the next fully reassembled reply.
    pub fn read_packet(&mut self) -> Option<Vec<u8>> {
        self.packets.pop_front()
    }

    /// Take the completion tags that have fired since the last call.
    pub fn take_completed(&mut self) -> Vec<CommandCallback> {
        std::mem::take(&mut self.completed)
    }

    /// Service the device: drain any waiting reports, then start the next
    /// queued command if none is in flight. Any transport error is fatal;
    /// the caller closes the slot.
    pub fn update(&mut self, handle: &mut dyn HidHandle) -> HidResult<()> {
        // A received packet can allow us to initiate a write, so check
        // reads before writes.
        self.check_reads(handle)?;
        self.check_writes(handle)
    }

    fn check_reads(&mut self, handle: &mut dyn HidHandle) -> HidResult<()> {
        loop {
            let mut buf = [0u8; REPORT_SIZE];
            match handle.read_timeout(&mut buf, 0)? {
                0 => return Ok(()),
                n => self.handle_report(&buf[..n]),
            }
        }
    }

    fn check_writes(&mut self, handle: &mut dyn HidHandle) -> HidResult<()> {
        // Don't send packets while a command is in flight.
        if self.current.is_some() || self.pending.is_empty() {
            return Ok(());
        }

        // Send every frame of the next command back to back. It stays
        // current until the device reports it finished.
        let cmd = self.pending.pop_front().expect("pending command");
        for frame in &cmd.frames {
            handle.write(frame)?;
        }
        self.current = Some(cmd);
        Ok(())
    }

    /// Feed one received report through the framing layer. Called from
    /// `update` and from the I/O thread's wait phase.
    pub fn handle_report(&mut self, report: &[u8]) {
        if report.is_empty() {
            return;
        }

        match report[0] {
            REPORT_ID_INPUT => {
                // Input state; bytes 1-2 are the pressed-panel mask.
                if report.len() >= 3 {
                    self.input_state = u16::from_le_bytes([report[1], report[2]]);
                }
            }
            REPORT_ID_SERIAL => {
                let frame = match packets::parse_serial_frame(report) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Communication error: {e} (ignored)");
                        return;
                    }
                };

                if frame.flags & FLAG_DEVICE_INFO != 0 {
                    self.handle_device_info(frame.payload);
                    return;
                }

                // If we're not active, ignore all packets other than device
                // info. Another process may own this device.
                if !self.active {
                    return;
                }

                self.assembly.extend_from_slice(frame.payload);

                if frame.flags & FLAG_END_OF_COMMAND != 0 {
                    if !self.assembly.is_empty() {
                        self.packets.push_back(std::mem::take(&mut self.assembly));
                    }
                    self.assembly.clear();
                }

                if frame.flags & FLAG_HOST_CMD_FINISHED != 0 {
                    // The device consumed the command we wrote; it's safe to
                    // start another.
                    self.complete_current();
                }
            }
            _ => {}
        }
    }

    fn handle_device_info(&mut self, payload: &[u8]) {
        // Any application can request device info, so only parse the reply
        // if we asked; otherwise it belongs to another process.
        let is_ours = self
            .current
            .as_ref()
            .map(|cmd| cmd.is_device_info)
            .unwrap_or(false);
        if !is_ours {
            return;
        }

        // The reply is: 'I', packet size, player char, reserved, 16 binary
        // serial bytes, firmware version, terminator. The wire payload can
        // run one byte short of the struct; pad with zeros.
        let mut data = payload.to_vec();
        data.resize(24, 0);

        self.info.player2 = data[2] == b'1';
        self.info.serial = data[4..20].iter().map(|b| format!("{b:02x}")).collect();
        self.info.firmware_version = u16::from_le_bytes([data[20], data[21]]);
        self.got_info = true;

        log::info!(
            "Received device info. Master version: {}, P{}",
            self.info.firmware_version,
            if self.info.player2 { 2 } else { 1 }
        );

        self.complete_current();
    }

    fn complete_current(&mut self) {
        if let Some(cmd) = self.current.take() {
            if let Some(tag) = cmd.callback {
                self.completed.push(tag);
            }
        }
    }
}
