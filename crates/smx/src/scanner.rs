//! Background device scanner
//!
//! Polls the HID enumeration at about 4 Hz, opening any pad that appears on
//! a path we haven't seen, and queues the opened handles for the manager to
//! claim. Paths stay remembered while they're enumerated, so a device is
//! only opened once per appearance; when the manager closes a device it
//! reports the path back with [`DeviceSource::device_was_closed`], which
//! forgets it so a re-plug on the same path produces a fresh handle.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hidapi::HidApi;

use crate::hid::{self, DeviceSource, OpenedDevice};

/// Polling interval between enumerations.
const SCAN_INTERVAL: Duration = Duration::from_millis(250);

struct ScannerState {
    /// Opened devices waiting for the manager to take them.
    available: VecDeque<OpenedDevice>,
    /// Paths the manager closed since the last scan; processed on the
    /// scanner thread before the next enumeration.
    closed_paths: Vec<String>,
    shutdown: bool,
}

struct ScannerShared {
    state: Mutex<ScannerState>,
    wake: Condvar,
}

/// The scanner thread handle. Implements [`DeviceSource`] for the manager.
pub struct DeviceScanner {
    shared: Arc<ScannerShared>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceScanner {
    pub fn new() -> DeviceScanner {
        let shared = Arc::new(ScannerShared {
            state: Mutex::new(ScannerState {
                available: VecDeque::new(),
                closed_paths: Vec::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("smx-device-scan".into())
            .spawn(move || scan_loop(&thread_shared))
            .expect("failed to spawn device scanner thread");

        DeviceScanner {
            shared,
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        let _ = thread.join();
    }
}

impl DeviceSource for DeviceScanner {
    fn take_device(&mut self) -> Option<OpenedDevice> {
        self.shared.state.lock().unwrap().available.pop_front()
    }

    fn device_was_closed(&mut self, path: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed_paths.push(path.to_string());
    }

    fn shutdown(&mut self) {
        self.stop();
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan_loop(shared: &ScannerShared) {
    // The hidapi context lives on this thread; creating it can fail
    // transiently (e.g. udev hiccups), so keep retrying at scan pace.
    let mut api: Option<HidApi> = None;

    // Paths seen on the previous scan. A path has to leave this set before
    // we'll open it again.
    let mut last_seen: HashSet<String> = HashSet::new();

    // Paths whose handle is queued or held by the manager.
    let mut claimed: HashSet<String> = HashSet::new();

    log::debug!("Scanner: thread started");

    loop {
        // Process close notifications first, so a closed path counts as new
        // on this scan.
        {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown {
                break;
            }
            for path in state.closed_paths.drain(..) {
                log::debug!("Scanner: forgetting closed device {path}");
                last_seen.remove(&path);
                claimed.remove(&path);
            }
        }

        scan_once(&mut api, &mut last_seen, &mut claimed, shared);

        let state = shared.state.lock().unwrap();
        if state.shutdown {
            break;
        }
        let (state, _) = shared.wake.wait_timeout(state, SCAN_INTERVAL).unwrap();
        if state.shutdown {
            break;
        }
    }

    log::debug!("Scanner: thread stopped");
}

fn scan_once(
    api: &mut Option<HidApi>,
    last_seen: &mut HashSet<String>,
    claimed: &mut HashSet<String>,
    shared: &ScannerShared,
) {
    match api {
        Some(existing) => {
            if let Err(e) = existing.refresh_devices() {
                // Keep the previous set on enumeration errors.
                log::warn!("Scanner: error listing USB devices: {e}");
                return;
            }
        }
        None => match HidApi::new() {
            // A fresh context has already enumerated; no refresh needed.
            Ok(new_api) => *api = Some(new_api),
            Err(e) => {
                log::warn!("Scanner: failed to initialize hidapi: {e}");
                return;
            }
        },
    }
    let Some(api) = api else {
        return;
    };

    let current: HashSet<String> = hid::enumerate_pad_paths(api).into_iter().collect();

    // Drop paths that are no longer present. If the manager still holds a
    // handle for one, its I/O will fail and close it shortly.
    for path in last_seen.iter() {
        if !current.contains(path) {
            log::info!("Scanner: device removed: {path}");
            claimed.remove(path);
            let mut state = shared.state.lock().unwrap();
            state.available.retain(|d| &d.path != path);
        }
    }

    // Open paths that weren't present last scan. Opening can race the
    // device going away, which isn't an error worth more than a log line.
    for path in current.iter() {
        if last_seen.contains(path) || claimed.contains(path) {
            continue;
        }

        match hid::open_pad(api, path) {
            Ok(device) => {
                log::info!("Scanner: device added: {path}");
                claimed.insert(path.clone());
                let mut state = shared.state.lock().unwrap();
                state.available.push_back(OpenedDevice {
                    path: path.clone(),
                    handle: Box::new(device),
                });
            }
            Err(e) => {
                log::info!("Scanner: error opening device {path}: {e}");
            }
        }
    }

    *last_seen = current;
}
