//! The manager: device slots, the I/O thread, and the public surface
//!
//! One high-priority thread owns all device I/O. Each tick it releases due
//! lights commands, refreshes panel test mode, claims newly scanned devices
//! into free slots, services both device state machines, and corrects the
//! P1/P2 slot order. Between ticks it either parks on the wake condvar (no
//! devices) or polls the open handles with short reads so device traffic
//! ends the wait immediately.
//!
//! All mutable state lives under one mutex, the single serialization point
//! between caller threads, the I/O thread, and the callback worker. Setters
//! mutate under the lock and poke the wake flag; they never block on I/O.
//! The HID handles themselves are owned by the I/O thread outside the lock,
//! so a blocking read never holds it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::Sender;

use crate::callback_worker::{CallbackWorker, UpdateCallback, WorkerEvent};
use crate::config::Config;
use crate::connection::CommandCallback;
use crate::device::Device;
use crate::hid::DeviceSource;
use crate::lights::{self, LightsScheduler, PAD_LIGHT_BYTES_25, PAD_LIGHT_BYTES_4X4};
use crate::packets::REPORT_SIZE;
use crate::scanner::DeviceScanner;
use crate::types::{PanelTestMode, SensorTestData, SensorTestMode, SmxInfo, UpdateReason};

/// Number of device slots ("player 1" and "player 2").
pub const PAD_COUNT: usize = 2;

/// LEDs on the platform strip, both pads combined.
const PLATFORM_STRIP_LEDS: usize = 88;

/// Re-send an active panel test mode this often so it doesn't time out on
/// the master.
const PANEL_TEST_KEEPALIVE: Duration = Duration::from_secs(1);

/// Tick interval when there's nothing to wait for.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Tick interval while a slot is free, to keep pace with the scanner.
const SCAN_WAIT: Duration = Duration::from_millis(100);

struct ManagerState {
    devices: [Device; PAD_COUNT],
    lights: LightsScheduler,

    panel_test_mode: PanelTestMode,
    last_sent_panel_test_mode: PanelTestMode,
    sent_panel_test_mode_at: Option<Instant>,

    /// Testing aid: drop lights submissions identical to the previous one.
    only_send_lights_on_change: bool,
    last_lights_data: Option<Vec<u8>>,

    shutdown: bool,
    /// Set by setters to end the I/O thread's wait early.
    wake: bool,
}

impl ManagerState {
    fn new() -> ManagerState {
        ManagerState {
            devices: [Device::default(), Device::default()],
            lights: LightsScheduler::default(),
            panel_test_mode: PanelTestMode::Off,
            last_sent_panel_test_mode: PanelTestMode::Off,
            sent_panel_test_mode_at: None,
            only_send_lights_on_change: false,
            last_lights_data: None,
            shutdown: false,
            wake: false,
        }
    }
}

struct Shared {
    state: Mutex<ManagerState>,
    wake: Condvar,
}

/// A slot's HID handle, owned by the I/O thread.
struct SlotIo {
    handle: Box<dyn crate::hid::HidHandle>,
    path: String,
    /// Set when a read failed during the wait phase; the next tick closes
    /// the slot with this error.
    failed: Option<String>,
}

type SlotIoArray = [Option<SlotIo>; PAD_COUNT];

/// The driver. Owns the scanner, the I/O thread, and the callback worker;
/// all methods are nonblocking. Getters return the most recent state;
/// setters do their work in the background, and calls against a pad that
/// isn't connected have no effect.
pub struct SmxManager {
    shared: Arc<Shared>,
    source: Arc<Mutex<Box<dyn DeviceSource>>>,
    worker: Option<CallbackWorker>,
    io_thread: Option<JoinHandle<()>>,
}

impl SmxManager {
    /// Start the driver and begin searching for devices. `callback` fires on
    /// the callback worker thread whenever something changes: connection or
    /// disconnection, inputs, configuration, test data. It doesn't say what
    /// changed; check whatever state you're interested in.
    pub fn new(callback: impl Fn(usize, UpdateReason) + Send + Sync + 'static) -> SmxManager {
        SmxManager::with_device_source(callback, Box::new(DeviceScanner::new()))
    }

    /// Start the driver against a custom [`DeviceSource`] instead of the
    /// USB scanner. This is how tests drive the full stack with scripted
    /// devices.
    pub fn with_device_source(
        callback: impl Fn(usize, UpdateReason) + Send + Sync + 'static,
        source: Box<dyn DeviceSource>,
    ) -> SmxManager {
        let worker = CallbackWorker::new(Box::new(callback) as Box<UpdateCallback>);
        let events = worker.sender();

        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState::new()),
            wake: Condvar::new(),
        });
        let source = Arc::new(Mutex::new(source));

        let thread_shared = shared.clone();
        let thread_source = source.clone();
        let io_thread = std::thread::Builder::new()
            .name("smx-io".into())
            .spawn(move || io_thread_main(&thread_shared, &thread_source, &events))
            .expect("failed to spawn I/O thread");

        SmxManager {
            shared,
            source,
            worker: Some(worker),
            io_thread: Some(io_thread),
        }
    }

    /// Shut down and disconnect from all devices. Waits for any queued user
    /// callbacks to complete; no callbacks fire after this returns.
    ///
    /// # Panics
    ///
    /// Panics if called from within the update callback, which would
    /// otherwise deadlock waiting for the callback worker to stop.
    pub fn stop(mut self) {
        self.shutdown_internal();
    }

    fn shutdown_internal(&mut self) {
        if self.io_thread.is_none() {
            return;
        }
        if let Some(worker) = &self.worker {
            assert!(
                !worker.is_current_thread(),
                "SmxManager::stop must not be called from an update callback"
            );
        }

        // Stop user callbacks first, then the scanner, then the I/O thread,
        // so nothing generates work for a thread that's already gone.
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.source.lock().unwrap().shutdown();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(thread) = self.io_thread.take() {
            let _ = thread.join();
        }
    }

    fn wake_io(&self) {
        self.shared.wake.notify_all();
    }

    /// Info about a pad. Use this to detect which pads are connected.
    pub fn get_info(&self, pad: usize) -> SmxInfo {
        let state = self.shared.state.lock().unwrap();
        match state.devices.get(pad) {
            Some(device) => device.get_info(),
            None => SmxInfo::default(),
        }
    }

    /// Mask of the currently pressed panels on a pad.
    pub fn get_input_state(&self, pad: usize) -> u16 {
        let state = self.shared.state.lock().unwrap();
        state.devices.get(pad).map(|d| d.input_state()).unwrap_or(0)
    }

    /// The pad's configuration, or None if it isn't connected. After a
    /// `set_config` this immediately returns the new value, without waiting
    /// for it to reach the device.
    pub fn get_config(&self, pad: usize) -> Option<Config> {
        let state = self.shared.state.lock().unwrap();
        state.devices.get(pad).and_then(|d| d.get_config())
    }

    /// Update the pad's configuration. Returns immediately; the write is
    /// coalesced and sent in the background.
    pub fn set_config(&self, pad: usize, config: &Config) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let Some(device) = state.devices.get_mut(pad) else {
                return;
            };
            device.set_config(*config);
            state.wake = true;
        }
        self.wake_io();
    }

    /// Reset a pad to its original configuration. Completion is reported
    /// with a [`UpdateReason::FactoryResetCommandComplete`] callback.
    pub fn factory_reset(&self, pad: usize) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let Some(device) = state.devices.get_mut(pad) else {
                return;
            };
            device.factory_reset();
            state.wake = true;
        }
        self.wake_io();
    }

    /// Request an immediate panel recalibration. Normally not needed, but
    /// helpful for diagnostics.
    pub fn force_recalibration(&self, pad: usize) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let Some(device) = state.devices.get_mut(pad) else {
                return;
            };
            device.force_recalibration();
            state.wake = true;
        }
        self.wake_io();
    }

    /// Set a sensor test mode and begin requesting test data.
    pub fn set_sensor_test_mode(&self, pad: usize, mode: SensorTestMode) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let Some(device) = state.devices.get_mut(pad) else {
                return;
            };
            device.set_sensor_test_mode(mode);
            state.wake = true;
        }
        self.wake_io();
    }

    /// The most recent test data, or None if none has arrived since the
    /// test mode was set.
    pub fn get_test_data(&self, pad: usize) -> Option<SensorTestData> {
        let state = self.shared.state.lock().unwrap();
        state.devices.get(pad).and_then(|d| d.get_test_data())
    }

    /// Update the lights. Both pads are always updated together. `data` is
    /// 8-bit RGB, one triple per LED: either 2 pads x 9 panels x 25 LEDs
    /// (the 4x4 grid then the 3x3 inner grid per panel), or the legacy 2 x
    /// 9 x 16 layout, which omits the inner grid.
    ///
    /// Lights update at up to 30 FPS. Submissions that arrive faster
    /// replace the queued frame; an in-progress frame always finishes
    /// first. The panels fall back to automatic lighting if no lights
    /// arrive for a while, so send updates continually even when nothing
    /// changes. Submissions are dropped while a panel test mode is active.
    pub fn set_lights(&self, data: &[u8]) {
        {
            let mut state = self.shared.state.lock().unwrap();

            // Don't send lights while a panel test mode is active.
            if state.panel_test_mode != PanelTestMode::Off {
                return;
            }

            let pad_size = match data.len() {
                n if n == 2 * PAD_LIGHT_BYTES_4X4 => PAD_LIGHT_BYTES_4X4,
                n if n == 2 * PAD_LIGHT_BYTES_25 => PAD_LIGHT_BYTES_25,
                n => {
                    log::warn!(
                        "set_lights: lights data must be {} or {} bytes, got {n}",
                        2 * PAD_LIGHT_BYTES_4X4,
                        2 * PAD_LIGHT_BYTES_25,
                    );
                    return;
                }
            };

            if state.only_send_lights_on_change {
                if state.last_lights_data.as_deref() == Some(data) {
                    log::debug!("set_lights: no change");
                    return;
                }
                state.last_lights_data = Some(data.to_vec());
            }

            // Pacing depends on the master firmware: version 4 and up
            // paces itself and takes a whole frame at once; older masters
            // need the host to stagger the two commands. If neither pad
            // has reported its config yet, it's still connecting; don't
            // queue anything.
            let mut any_connected = false;
            let mut master_is_v4 = false;
            for device in &state.devices {
                if let Some(config) = device.get_config() {
                    any_connected = true;
                    if config.master_version >= 4 {
                        master_is_v4 = true;
                    }
                }
            }
            if !any_connected {
                return;
            }

            state.lights.queue_frame(Instant::now(), master_is_v4);

            for pad in 0..PAD_COUNT {
                let Some(config) = state.devices[pad].get_config() else {
                    continue;
                };
                let mut commands =
                    lights::build_pad_commands(&data[pad * pad_size..(pad + 1) * pad_size]);
                if config.master_version < 4 {
                    // This pad doesn't understand the '4' command.
                    commands[0] = Vec::new();
                }
                state.lights.set_pad_commands(pad, commands);
            }

            state.wake = true;
        }
        self.wake_io();
    }

    /// Set the platform LED strip color, both pads together: 88 LEDs x
    /// 3 RGB bytes. Ignored for masters that don't support the strip.
    pub fn set_platform_lights(&self, data: &[u8]) {
        {
            let mut state = self.shared.state.lock().unwrap();

            if data.len() != PLATFORM_STRIP_LEDS * 3 {
                log::warn!(
                    "set_platform_lights: data must be {} bytes, got {}",
                    PLATFORM_STRIP_LEDS * 3,
                    data.len()
                );
                return;
            }

            let per_pad = data.len() / PAD_COUNT;
            for pad in 0..PAD_COUNT {
                let Some(config) = state.devices[pad].get_config() else {
                    continue;
                };
                if config.master_version < 4 {
                    continue;
                }

                let mut command = vec![b'L', 0, (per_pad / 3) as u8];
                command.extend_from_slice(&data[pad * per_pad..(pad + 1) * per_pad]);
                state.devices[pad].send_command(&command, None);
            }

            state.wake = true;
        }
        self.wake_io();
    }

    /// Immediately re-enable the panels' automatic lighting, without
    /// waiting for the timeout. Scheduled lights commands are discarded so
    /// one can't land afterwards and disable it again.
    pub fn reenable_auto_lights(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.lights.clear();
            for pad in 0..PAD_COUNT {
                state.devices[pad].send_command(b"S 1\n", None);
            }
            state.wake = true;
        }
        self.wake_io();
    }

    /// Set a panel test mode. This applies to all connected pads, and
    /// lights can't be updated while a mode is active.
    pub fn set_panel_test_mode(&self, mode: PanelTestMode) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.panel_test_mode = mode;
            state.wake = true;
        }
        self.wake_io();
    }

    /// Assign serial numbers to the master controllers. This is one-time
    /// provisioning: it has no effect on a master that already has one.
    pub fn set_serial_numbers(&self, serials: &[[u8; 16]; PAD_COUNT]) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.lights.clear();
            for pad in 0..PAD_COUNT {
                let mut command = vec![b's'];
                command.extend_from_slice(&serials[pad]);
                command.push(b'\n');
                state.devices[pad].send_command(&command, None);
            }
            state.wake = true;
        }
        self.wake_io();
    }

    /// Testing aid: when enabled, a lights submission identical to the
    /// previous one is dropped instead of scheduled. The controllers
    /// normally expect regular updates even when nothing changes.
    pub fn set_only_send_lights_on_change(&self, enable: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.only_send_lights_on_change = enable;
        state.last_lights_data = None;
    }
}

impl Drop for SmxManager {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            if worker.is_current_thread() {
                // Unwinding here would abort the process; leak the threads
                // instead and complain.
                log::error!("SmxManager dropped from within an update callback; leaking threads");
                return;
            }
        }
        self.shutdown_internal();
    }
}

// ---------------------------------------------------------------------------
// I/O thread

fn io_thread_main(
    shared: &Shared,
    source: &Mutex<Box<dyn DeviceSource>>,
    events: &Sender<WorkerEvent>,
) {
    log::debug!("I/O thread started");
    let mut io: SlotIoArray = [None, None];

    loop {
        let wait;
        {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown {
                break;
            }
            tick(&mut state, &mut io, source, events);
            wait = compute_wait(&state, &io);
        }
        wait_for_events(shared, &mut io, wait);
    }
    log::debug!("I/O thread stopped");
}

fn tick(
    state: &mut ManagerState,
    io: &mut SlotIoArray,
    source: &Mutex<Box<dyn DeviceSource>>,
    events: &Sender<WorkerEvent>,
) {
    let now = Instant::now();

    // Release any scheduled lights commands first; they only queue into the
    // per-device FIFOs and are written below.
    send_light_updates(state, now);

    update_panel_test_mode(state, now);

    attempt_connections(state, io, source);

    for pad in 0..PAD_COUNT {
        let result = match io[pad].as_mut() {
            Some(slot) => match slot.failed.take() {
                Some(message) => Err(hidapi::HidError::HidApiError { message }),
                None => state.devices[pad].update(slot.handle.as_mut(), now),
            },
            None => Ok(Vec::new()),
        };

        match result {
            Ok(device_events) => {
                for reason in device_events {
                    let _ = events.send(WorkerEvent::Callback(pad, reason));
                }
            }
            Err(e) => {
                log::info!("Device error: {e}");

                // Tell the scanner the device was closed, so it'll notice a
                // new device appearing on the same path.
                let slot = io[pad].take().expect("failed slot must be open");
                source.lock().unwrap().device_was_closed(&slot.path);
                state.devices[pad].close();
                let _ = events.send(WorkerEvent::Callback(pad, UpdateReason::Updated));
            }
        }

        // Dispatch completions for anything that finished this tick,
        // including commands flushed by a close above.
        let mut completion_events = Vec::new();
        for tag in state.devices[pad].connection.take_completed() {
            match tag {
                CommandCallback::LightsSent => state.lights.command_finished(),
                other => state.devices[pad].handle_completion(other, &mut completion_events),
            }
        }
        for reason in completion_events {
            let _ = events.send(WorkerEvent::Callback(pad, reason));
        }
    }

    // Devices may have finished initializing, so see if the slot order
    // needs fixing.
    correct_device_order(state, io);
}

/// Claim newly scanned devices into free slots. Devices stay queued at the
/// source while both slots are occupied.
fn attempt_connections(
    state: &mut ManagerState,
    io: &mut SlotIoArray,
    source: &Mutex<Box<dyn DeviceSource>>,
) {
    for pad in 0..PAD_COUNT {
        if io[pad].is_some() {
            continue;
        }
        let Some(device) = source.lock().unwrap().take_device() else {
            return;
        };
        log::info!("Opening pad device {}", device.path);
        io[pad] = Some(SlotIo {
            handle: device.handle,
            path: device.path,
            failed: None,
        });
        state.devices[pad].open();
    }
}

/// Release scheduled lights commands whose time has come, queueing them
/// into the device FIFOs. While released commands are still in flight,
/// nothing more is released, which is what paces pre-v4 masters.
fn send_light_updates(state: &mut ManagerState, now: Instant) {
    if state.lights.commands_in_progress() > 0 {
        return;
    }

    let ManagerState { lights, devices, .. } = state;
    while let Some(command) = lights.pop_due(now) {
        for pad in 0..PAD_COUNT {
            let payload = &command.pad_commands[pad];
            if payload.is_empty() {
                continue;
            }
            lights.note_command_sent();
            devices[pad].send_command(payload, Some(CommandCallback::LightsSent));
        }
    }
}

/// Send panel test mode commands as needed: once on every change, and once
/// a second while a mode is active so it doesn't time out on the master.
fn update_panel_test_mode(state: &mut ManagerState, now: Instant) {
    let mode = state.panel_test_mode;

    if mode == state.last_sent_panel_test_mode {
        if mode == PanelTestMode::Off {
            return;
        }
        if let Some(at) = state.sent_panel_test_mode_at {
            if now.duration_since(at) < PANEL_TEST_KEEPALIVE {
                return;
            }
        }
    }

    // On the first transition out of Off, turn off the lights. The 'l'
    // command used to set lights and is now only used to black them out
    // for cases like this.
    if state.last_sent_panel_test_mode == PanelTestMode::Off {
        let mut command = vec![b'l'];
        command.extend_from_slice(&[0u8; 108]);
        command.push(b'\n');
        for device in &mut state.devices {
            device.send_command(&command, None);
        }
    }

    state.sent_panel_test_mode_at = Some(now);
    state.last_sent_panel_test_mode = mode;
    for device in &mut state.devices {
        device.send_command(&[b't', b' ', mode.mode_byte(), b'\n'], None);
    }
}

/// We don't know whether a device is P1 or P2 until its info arrives. If a
/// P2 device sits in slot 0 or a P1 device in slot 1, swap the slots (and
/// their handles). If both report the same player the pads are
/// misconfigured and the order is left alone.
fn correct_device_order(state: &mut ManagerState, io: &mut SlotIoArray) {
    let connected = [
        state.devices[0].is_connected(),
        state.devices[1].is_connected(),
    ];
    let player2 = [state.devices[0].is_player2(), state.devices[1].is_player2()];

    if connected[0] && connected[1] && player2[0] == player2[1] {
        return;
    }

    let slot0_needs_swap = connected[0] && player2[0];
    let slot1_needs_swap = connected[1] && !player2[1];
    if slot0_needs_swap || slot1_needs_swap {
        log::info!("Swapping slots to match player order");
        state.devices.swap(0, 1);
        io.swap(0, 1);
    }
}

/// How long the wait phase may block: until the next scheduled lights
/// command (with a millisecond of margin for timer resolution), sooner
/// while a slot is free so new devices are claimed promptly.
fn compute_wait(state: &ManagerState, io: &SlotIoArray) -> Duration {
    let mut wait = if io.iter().any(|slot| slot.is_none()) {
        SCAN_WAIT
    } else {
        IDLE_WAIT
    };

    if let Some(at) = state.lights.next_send_time() {
        let until = at.saturating_duration_since(Instant::now()) + Duration::from_millis(1);
        wait = wait.min(until);
    }

    wait
}

/// Block until something needs a tick: the wake flag, a received report, a
/// failed read, or the deadline. The state mutex is only held for brief
/// moments in here, never across a blocking read.
fn wait_for_events(shared: &Shared, io: &mut SlotIoArray, wait: Duration) {
    if io.iter().all(|slot| slot.is_none()) {
        let state = shared.state.lock().unwrap();
        if state.wake || state.shutdown {
            drop(clear_wake(state));
            return;
        }
        let (state, _) = shared.wake.wait_timeout(state, wait).unwrap();
        drop(clear_wake(state));
        return;
    }

    // With devices open, short blocking reads are the wait: a received
    // report ends it, and the wake flag is checked between reads.
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; REPORT_SIZE];
    loop {
        {
            let state = shared.state.lock().unwrap();
            if state.wake || state.shutdown {
                drop(clear_wake(state));
                return;
            }
        }

        let mut got_report = false;
        for pad in 0..PAD_COUNT {
            let Some(slot) = io[pad].as_mut() else {
                continue;
            };
            if slot.failed.is_some() {
                return;
            }
            match slot.handle.read_timeout(&mut buf, 1) {
                Ok(0) => {}
                Ok(n) => {
                    let mut state = shared.state.lock().unwrap();
                    state.devices[pad].connection.handle_report(&buf[..n]);
                    got_report = true;
                }
                Err(e) => {
                    slot.failed = Some(e.to_string());
                    return;
                }
            }
        }

        if got_report || Instant::now() >= deadline {
            return;
        }
    }
}

fn clear_wake(
    mut state: std::sync::MutexGuard<'_, ManagerState>,
) -> std::sync::MutexGuard<'_, ManagerState> {
    state.wake = false;
    state
}
