//! Test doubles for driving a full manager without hardware: a scripted pad
//! speaking the real wire protocol behind `HidHandle`, and a `DeviceSource`
//! that hands it out like the scanner would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hidapi::{HidError, HidResult};
use smx::config::{legacy, Config};
use smx::{HidHandle, OpenedDevice, UpdateReason};

const REPORT_SIZE: usize = 64;
const MAX_PAYLOAD: usize = 61;
const FLAG_END_OF_COMMAND: u8 = 0x01;
const FLAG_HOST_CMD_FINISHED: u8 = 0x02;
const FLAG_START_OF_COMMAND: u8 = 0x04;
const FLAG_DEVICE_INFO: u8 = 0x80;

/// One command the host delivered to the pad, with its arrival time.
#[derive(Clone)]
pub struct ReceivedCommand {
    pub at: Instant,
    pub data: Vec<u8>,
}

impl ReceivedCommand {
    pub fn selector(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }
}

pub struct PadBehavior {
    /// `'0'` for P1, `'1'` for P2.
    pub player: u8,
    pub firmware_version: u16,
    pub serial_byte: u8,
    /// The config packet the pad reports, in whichever layout its firmware
    /// speaks.
    pub config_bytes: Vec<u8>,
    /// Factory defaults restored by the `f` command.
    pub default_config_bytes: Vec<u8>,
    /// Bit-planed words returned for `y` requests, if any.
    pub sensor_reply_words: Option<Vec<u16>>,
}

impl PadBehavior {
    /// A firmware-5 pad speaking the current config layout.
    pub fn firmware5(player: u8) -> PadBehavior {
        let mut config = Config::default();
        config.master_version = 5;
        let bytes = config.to_bytes().to_vec();
        PadBehavior {
            player,
            // The ASCII player byte doubles as a recognizable serial fill.
            firmware_version: 5,
            serial_byte: player,
            config_bytes: bytes.clone(),
            default_config_bytes: bytes,
            sensor_reply_words: None,
        }
    }

    /// A pre-5 pad speaking the old config layout, with the given master
    /// version in it.
    pub fn legacy(player: u8, firmware_version: u16, master_version: u8) -> PadBehavior {
        let mut config = Config::default();
        config.master_version = master_version;
        config.config_version = 3;
        let mut bytes = Vec::new();
        legacy::convert_to_old(&config, &mut bytes);
        PadBehavior {
            player,
            firmware_version,
            serial_byte: player + 0x10,
            config_bytes: bytes.clone(),
            default_config_bytes: bytes,
            sensor_reply_words: None,
        }
    }
}

struct PadState {
    behavior: PadBehavior,
    commands: Vec<ReceivedCommand>,
    read_queue: VecDeque<Vec<u8>>,
    assembly: Vec<u8>,
    fail_io: bool,
}

/// Shared scripting handle for one fake pad. The same state backs the
/// `HidHandle` given to the manager and the test's assertions.
#[derive(Clone)]
pub struct PadControl {
    state: Arc<Mutex<PadState>>,
}

/// The `HidHandle` half of a fake pad.
pub struct FakePadHandle {
    state: Arc<Mutex<PadState>>,
}

pub fn fake_pad(behavior: PadBehavior) -> (FakePadHandle, PadControl) {
    let state = Arc::new(Mutex::new(PadState {
        behavior,
        commands: Vec::new(),
        read_queue: VecDeque::new(),
        assembly: Vec::new(),
        fail_io: false,
    }));
    (
        FakePadHandle { state: state.clone() },
        PadControl { state },
    )
}

impl PadControl {
    /// All commands received so far.
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands with the given selector byte.
    pub fn commands_with_selector(&self, selector: u8) -> Vec<ReceivedCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.selector() == selector)
            .collect()
    }

    /// Simulate panels being pressed or released.
    pub fn set_input_state(&self, mask: u16) {
        let mut state = self.state.lock().unwrap();
        let mut report = vec![0u8; REPORT_SIZE];
        report[0] = 3;
        report[1..3].copy_from_slice(&mask.to_le_bytes());
        state.read_queue.push_back(report);
    }

    /// Make every subsequent read and write fail, as if unplugged.
    pub fn fail_io(&self) {
        self.state.lock().unwrap().fail_io = true;
    }

    pub fn set_sensor_reply_words(&self, words: Vec<u16>) {
        self.state.lock().unwrap().behavior.sensor_reply_words = Some(words);
    }
}

impl HidHandle for FakePadHandle {
    fn write(&mut self, data: &[u8]) -> HidResult<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(HidError::HidApiError {
                message: "fake pad unplugged".into(),
            });
        }
        if data.len() < 3 || data[0] != 5 {
            return Ok(data.len());
        }

        let flags = data[1];
        let len = data[2] as usize;
        let payload = &data[3..3 + len.min(MAX_PAYLOAD)];

        if flags & FLAG_DEVICE_INFO != 0 {
            let reply = info_reply_payload(&state.behavior);
            queue_frames(&mut state.read_queue, FLAG_DEVICE_INFO, &reply);
            return Ok(data.len());
        }

        let payload = payload.to_vec();
        state.assembly.extend_from_slice(&payload);
        if flags & FLAG_END_OF_COMMAND != 0 {
            let command = std::mem::take(&mut state.assembly);
            handle_command(&mut state, command);
        }
        Ok(data.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize> {
        let report = {
            let mut state = self.state.lock().unwrap();
            if state.fail_io {
                return Err(HidError::HidApiError {
                    message: "fake pad unplugged".into(),
                });
            }
            state.read_queue.pop_front()
        };

        match report {
            Some(report) => {
                buf[..report.len()].copy_from_slice(&report);
                Ok(report.len())
            }
            None => {
                if timeout_ms > 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(0)
            }
        }
    }
}

fn info_reply_payload(behavior: &PadBehavior) -> Vec<u8> {
    let mut payload = vec![b'I', 23, behavior.player, 0];
    payload.extend_from_slice(&[behavior.serial_byte; 16]);
    payload.extend_from_slice(&behavior.firmware_version.to_le_bytes());
    payload.push(b'\n');
    payload
}

fn handle_command(state: &mut PadState, command: Vec<u8>) {
    state.commands.push(ReceivedCommand {
        at: Instant::now(),
        data: command.clone(),
    });

    match command.first().copied() {
        Some(b'g') | Some(b'G') => {
            let selector = command[0];
            let config = state.behavior.config_bytes.clone();
            let mut reply = vec![selector, config.len() as u8];
            reply.extend_from_slice(&config);
            queue_frames(&mut state.read_queue, FLAG_START_OF_COMMAND | FLAG_END_OF_COMMAND, &reply);
            queue_finished(&mut state.read_queue);
        }
        Some(b'w') | Some(b'W') => {
            // Accept the written bytes as the new stored config. A write
            // shorter than the full packet replaces only its prefix.
            if command.len() >= 2 {
                let len = (command[1] as usize).min(command.len() - 2);
                let incoming = &command[2..2 + len];
                if state.behavior.config_bytes.len() < incoming.len() {
                    state.behavior.config_bytes.resize(incoming.len(), 0);
                }
                state.behavior.config_bytes[..incoming.len()].copy_from_slice(incoming);
            }
            queue_finished(&mut state.read_queue);
        }
        Some(b'f') => {
            state.behavior.config_bytes = state.behavior.default_config_bytes.clone();
            queue_finished(&mut state.read_queue);
        }
        Some(b'y') => {
            if let Some(words) = state.behavior.sensor_reply_words.clone() {
                let mode = command.get(1).copied().unwrap_or(b'0');
                let mut reply = vec![b'y', mode, words.len() as u8];
                for word in words {
                    reply.extend_from_slice(&word.to_le_bytes());
                }
                queue_frames(
                    &mut state.read_queue,
                    FLAG_START_OF_COMMAND | FLAG_END_OF_COMMAND,
                    &reply,
                );
            }
            queue_finished(&mut state.read_queue);
        }
        _ => {
            // Lights, test modes, recalibration, provisioning: consume and
            // acknowledge.
            queue_finished(&mut state.read_queue);
        }
    }
}

/// Frame a reply payload into 64-byte reports the way the pad does. The
/// passed flags are distributed: start on the first frame, end on the last.
fn queue_frames(queue: &mut VecDeque<Vec<u8>>, flags: u8, payload: &[u8]) {
    let mut offset = 0;
    loop {
        let chunk = (payload.len() - offset).min(MAX_PAYLOAD);
        let mut frame_flags = flags & !(FLAG_START_OF_COMMAND | FLAG_END_OF_COMMAND);
        if offset == 0 {
            frame_flags |= flags & FLAG_START_OF_COMMAND;
        }
        if offset + chunk == payload.len() {
            frame_flags |= flags & FLAG_END_OF_COMMAND;
        }

        let mut report = vec![0u8; REPORT_SIZE];
        report[0] = 6;
        report[1] = frame_flags;
        report[2] = chunk as u8;
        report[3..3 + chunk].copy_from_slice(&payload[offset..offset + chunk]);
        queue.push_back(report);

        offset += chunk;
        if offset >= payload.len() {
            break;
        }
    }
}

fn queue_finished(queue: &mut VecDeque<Vec<u8>>) {
    let mut report = vec![0u8; REPORT_SIZE];
    report[0] = 6;
    report[1] = FLAG_HOST_CMD_FINISHED;
    queue.push_back(report);
}

// ---------------------------------------------------------------------------
// Device source

struct BusState {
    queue: VecDeque<OpenedDevice>,
    closed: Vec<String>,
}

/// A `DeviceSource` fed by the test instead of USB enumeration.
pub struct FakeBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Clone)]
pub struct BusControl {
    state: Arc<Mutex<BusState>>,
}

pub fn fake_bus() -> (FakeBus, BusControl) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = Arc::new(Mutex::new(BusState {
        queue: VecDeque::new(),
        closed: Vec::new(),
    }));
    (FakeBus { state: state.clone() }, BusControl { state })
}

impl smx::DeviceSource for FakeBus {
    fn take_device(&mut self) -> Option<OpenedDevice> {
        self.state.lock().unwrap().queue.pop_front()
    }

    fn device_was_closed(&mut self, path: &str) {
        self.state.lock().unwrap().closed.push(path.to_string());
    }
}

impl BusControl {
    /// Plug in a fake pad under the given path.
    pub fn add_pad(&self, path: &str, behavior: PadBehavior) -> PadControl {
        let (handle, control) = fake_pad(behavior);
        self.state.lock().unwrap().queue.push_back(OpenedDevice {
            path: path.to_string(),
            handle: Box::new(handle),
        });
        control
    }

    /// Paths the manager reported closed.
    pub fn closed_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().closed.clone()
    }
}

// ---------------------------------------------------------------------------
// Callback recording and polling helpers

/// Records `(pad, reason)` callbacks for assertions.
#[derive(Clone, Default)]
pub struct CallbackLog {
    events: Arc<Mutex<Vec<(usize, UpdateReason)>>>,
}

impl CallbackLog {
    pub fn new() -> CallbackLog {
        CallbackLog::default()
    }

    pub fn recorder(&self) -> impl Fn(usize, UpdateReason) + Send + Sync + 'static {
        let events = self.events.clone();
        move |pad, reason| events.lock().unwrap().push((pad, reason))
    }

    pub fn events(&self) -> Vec<(usize, UpdateReason)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: UpdateReason) -> usize {
        self.events()
            .iter()
            .filter(|(_, reason)| *reason == wanted)
            .count()
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it
/// held.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Pack per-panel 10-byte streams into the bit-planed words of a sensor
/// test reply.
pub fn bit_plane_panels(panel_bytes: &[[u8; 10]; 9]) -> Vec<u16> {
    let mut words = vec![0u16; 80];
    for (panel, bytes) in panel_bytes.iter().enumerate() {
        for (i, byte) in bytes.iter().enumerate() {
            for j in 0..8 {
                if byte & (1 << j) != 0 {
                    words[i * 8 + j] |= 1 << panel;
                }
            }
        }
    }
    words
}

/// A panel's sensor-test byte stream with the 0-1-0 signature.
pub fn panel_stream(sensors: [i16; 4], dip: u8) -> [u8; 10] {
    let mut data = [0u8; 10];
    data[0] = 0b010;
    for (i, level) in sensors.iter().enumerate() {
        let bytes = level.to_le_bytes();
        data[1 + i * 2] = bytes[0];
        data[2 + i * 2] = bytes[1];
    }
    data[9] = dip & 0x0F;
    data
}
