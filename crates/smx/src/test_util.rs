//! Shared helpers for unit tests: a scripted HID handle and wire-format
//! builders for the replies a pad sends.

use std::collections::VecDeque;

use hidapi::HidResult;

use crate::config::{Config, CONFIG_PACKET_SIZE};
use crate::hid::HidHandle;
use crate::packets::{
    FLAG_DEVICE_INFO, FLAG_END_OF_COMMAND, FLAG_HOST_CMD_FINISHED, FLAG_START_OF_COMMAND,
    MAX_PAYLOAD, REPORT_ID_SERIAL, REPORT_SIZE,
};

/// A HID handle that replays queued reports and records writes.
#[derive(Default)]
pub(crate) struct MockHandle {
    pub reads: VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
}

impl HidHandle for MockHandle {
    fn write(&mut self, data: &[u8]) -> HidResult<usize> {
        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout_ms: i32) -> HidResult<usize> {
        match self.reads.pop_front() {
            Some(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            None => Ok(0),
        }
    }
}

impl MockHandle {
    /// Payloads of the commands written so far, reassembled from frames,
    /// ignoring the device info request.
    pub fn written_commands(&self) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();
        let mut assembly = Vec::new();
        for report in &self.writes {
            if report[1] & FLAG_DEVICE_INFO != 0 {
                continue;
            }
            let len = report[2] as usize;
            assembly.extend_from_slice(&report[3..3 + len]);
            if report[1] & FLAG_END_OF_COMMAND != 0 {
                commands.push(std::mem::take(&mut assembly));
            }
        }
        commands
    }
}

/// Build one device-to-host serial frame.
pub(crate) fn serial_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_PAYLOAD);
    let mut report = vec![0u8; REPORT_SIZE];
    report[0] = REPORT_ID_SERIAL;
    report[1] = flags;
    report[2] = payload.len() as u8;
    report[3..3 + payload.len()].copy_from_slice(payload);
    report
}

/// Split a reply payload into framed reports the way a pad does.
pub(crate) fn framed_reply(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        let chunk = (payload.len() - offset).min(MAX_PAYLOAD);
        let mut flags = 0;
        if offset == 0 {
            flags |= FLAG_START_OF_COMMAND;
        }
        if offset + chunk == payload.len() {
            flags |= FLAG_END_OF_COMMAND;
        }
        frames.push(serial_frame(flags, &payload[offset..offset + chunk]));
        offset += chunk;
        if offset >= payload.len() {
            break;
        }
    }
    frames
}

/// The frame acknowledging that the last host command finished.
pub(crate) fn finished_frame() -> Vec<u8> {
    serial_frame(FLAG_HOST_CMD_FINISHED, b"")
}

/// A device info reply for the given player ('0' or '1') and firmware.
pub(crate) fn info_reply(player: u8, firmware: u16, serial_byte: u8) -> Vec<u8> {
    let mut payload = vec![b'I', 23, player, 0];
    payload.extend_from_slice(&[serial_byte; 16]);
    payload.extend_from_slice(&firmware.to_le_bytes());
    payload.push(b'\n');
    serial_frame(FLAG_DEVICE_INFO, &payload)
}

/// A full `G` config reply carrying the new-layout serialization of
/// `config`, already split into frames.
pub(crate) fn config_reply(cmd: u8, config: &Config) -> Vec<Vec<u8>> {
    config_reply_raw(cmd, &config.to_bytes())
}

/// A config reply carrying arbitrary raw bytes (for the old layout).
pub(crate) fn config_reply_raw(cmd: u8, bytes: &[u8]) -> Vec<Vec<u8>> {
    assert!(bytes.len() <= CONFIG_PACKET_SIZE);
    let mut payload = vec![cmd, bytes.len() as u8];
    payload.extend_from_slice(bytes);
    framed_reply(&payload)
}
