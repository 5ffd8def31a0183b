//! HID transport
//!
//! The pads enumerate as ordinary USB HID devices using the stock Arduino
//! VID/PID, so matching goes by the product string as well. All actual I/O
//! goes through the [`HidHandle`] trait, which [`hidapi::HidDevice`]
//! implements directly; tests drive the full stack with scripted fake
//! handles instead.

use hidapi::{HidApi, HidDevice, HidError, HidResult};

/// USB vendor id of the pads (stock Arduino).
pub const VENDOR_ID: u16 = 0x2341;

/// USB product id of the pads (stock Arduino).
pub const PRODUCT_ID: u16 = 0x8037;

/// Product string the pads report. Since the VID/PID are the Arduino
/// defaults, this is what actually distinguishes a pad from some other
/// Arduino device.
pub const PRODUCT_NAME: &str = "StepManiaX";

/// An open HID endpoint speaking 64-byte reports.
///
/// `read_timeout` returns `Ok(0)` when no report arrived within the timeout;
/// that's the only transient condition. Any `Err` from either call is fatal
/// for the device and the caller will close it.
pub trait HidHandle: Send {
    /// Write one report, report id in the first byte.
    fn write(&mut self, data: &[u8]) -> HidResult<usize>;

    /// Read one report into `buf`, waiting up to `timeout_ms`. A timeout of
    /// zero polls without blocking.
    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize>;
}

impl HidHandle for HidDevice {
    fn write(&mut self, data: &[u8]) -> HidResult<usize> {
        HidDevice::write(self, data)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize> {
        HidDevice::read_timeout(self, buf, timeout_ms)
    }
}

/// A discovered device, ready to be handed to a manager slot. The path is
/// the device's identity: the scanner won't hand out the same path again
/// until it's told the device was closed.
pub struct OpenedDevice {
    pub path: String,
    pub handle: Box<dyn HidHandle>,
}

/// Source of pad devices for the manager.
///
/// The production implementation is the background [`DeviceScanner`]; tests
/// substitute one that hands out fake handles.
///
/// [`DeviceScanner`]: crate::scanner::DeviceScanner
pub trait DeviceSource: Send {
    /// Take one newly discovered device, if any. Ownership of the handle
    /// moves to the caller. Devices not taken stay queued.
    fn take_device(&mut self) -> Option<OpenedDevice>;

    /// Tell the source that a device it previously returned was closed, so
    /// the same path is treated as a fresh device if it shows up again.
    fn device_was_closed(&mut self, path: &str);

    /// Stop any background work. Called once during manager shutdown,
    /// before the I/O thread is joined.
    fn shutdown(&mut self) {}
}

/// List the device paths of all connected pads.
pub(crate) fn enumerate_pad_paths(api: &HidApi) -> Vec<String> {
    let mut paths = Vec::new();
    for info in api.device_list() {
        if info.vendor_id() != VENDOR_ID || info.product_id() != PRODUCT_ID {
            continue;
        }
        // Filter on the product name so other Arduino devices don't match.
        if info.product_string() != Some(PRODUCT_NAME) {
            continue;
        }
        paths.push(info.path().to_string_lossy().into_owned());
    }
    paths
}

/// Open a pad by path. The handle is put in non-blocking mode; the I/O
/// thread paces itself with `read_timeout`.
pub(crate) fn open_pad(api: &HidApi, path: &str) -> HidResult<HidDevice> {
    let cpath = std::ffi::CString::new(path)
        .map_err(|_| HidError::HidApiError { message: format!("bad device path: {path}") })?;
    let device = api.open_path(&cpath)?;
    device.set_blocking_mode(false)?;
    Ok(device)
}
