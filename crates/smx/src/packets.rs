//! Serial-over-HID framing
//!
//! Commands and replies ride on fixed 64-byte HID reports. Host-to-device
//! frames use report id 5; device-to-host frames use report id 6. Both carry
//! a flags byte, a payload length (up to 61), and the payload:
//!
//! ```text
//! byte 0       report id
//! byte 1       flags
//! byte 2       payload length <= 61
//! bytes 3..64  payload, zero padded
//! ```
//!
//! A command larger than one frame is split across several; the first frame
//! carries the start-of-command flag and the last the end-of-command flag. A
//! reply is reassembled the same way. An independent frame with the
//! host-command-finished flag tells us the device has consumed the last host
//! command and another may be written.

/// Report id of input state reports (device to host).
pub(crate) const REPORT_ID_INPUT: u8 = 3;

/// Report id of serial frames sent host to device.
pub(crate) const REPORT_ID_COMMAND: u8 = 5;

/// Report id of serial frames sent device to host.
pub(crate) const REPORT_ID_SERIAL: u8 = 6;

/// Every HID report is this size, padded with zeros.
pub(crate) const REPORT_SIZE: usize = 64;

/// Payload bytes that fit in one frame.
pub(crate) const MAX_PAYLOAD: usize = REPORT_SIZE - 3;

pub(crate) const FLAG_END_OF_COMMAND: u8 = 0x01;
pub(crate) const FLAG_HOST_CMD_FINISHED: u8 = 0x02;
pub(crate) const FLAG_START_OF_COMMAND: u8 = 0x04;
pub(crate) const FLAG_DEVICE_INFO: u8 = 0x80;

/// A single 64-byte report.
pub(crate) type Report = [u8; REPORT_SIZE];

/// A parsed inbound serial frame.
#[derive(Debug)]
pub(crate) struct SerialFrame<'a> {
    pub flags: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FrameError {
    /// The report is too short to carry the framing header.
    #[error("truncated packet")]
    Truncated,
    /// The length byte claims more payload than the report holds.
    #[error("oversized packet")]
    Oversized,
}

/// Parse a device-to-host serial frame (report id already checked).
pub(crate) fn parse_serial_frame(report: &[u8]) -> Result<SerialFrame<'_>, FrameError> {
    if report.len() < 3 {
        return Err(FrameError::Truncated);
    }
    let flags = report[1];
    let len = report[2] as usize;
    if 3 + len > report.len() {
        return Err(FrameError::Oversized);
    }
    Ok(SerialFrame {
        flags,
        payload: &report[3..3 + len],
    })
}

/// Split a command into padded frames, tagging the first and last.
///
/// A zero-length command still produces one (empty) frame; that's allowed
/// for testing against the firmware.
pub(crate) fn split_command(cmd: &[u8]) -> Vec<Report> {
    let mut frames = Vec::with_capacity(cmd.len() / MAX_PAYLOAD + 1);
    let mut offset = 0;

    loop {
        let chunk = (cmd.len() - offset).min(MAX_PAYLOAD);

        let mut flags = 0;
        if offset == 0 {
            flags |= FLAG_START_OF_COMMAND;
        }
        if offset + chunk == cmd.len() {
            flags |= FLAG_END_OF_COMMAND;
        }

        let mut report: Report = [0; REPORT_SIZE];
        report[0] = REPORT_ID_COMMAND;
        report[1] = flags;
        report[2] = chunk as u8;
        report[3..3 + chunk].copy_from_slice(&cmd[offset..offset + chunk]);
        frames.push(report);

        offset += chunk;
        if offset >= cmd.len() {
            break;
        }
    }

    frames
}

/// The device info request: an empty frame with only the device-info flag.
/// Any application can send this at any time, even while another process
/// owns the device, so it's safe during enumeration.
pub(crate) fn device_info_request() -> Report {
    let mut report: Report = [0; REPORT_SIZE];
    report[0] = REPORT_ID_COMMAND;
    report[1] = FLAG_DEVICE_INFO;
    report
}
