//! System libudev backend
//!
//! Thin [`Registry`] implementation over the raw `libudev-sys` bindings. Every
//! string libudev hands out is copied before the call returns; nothing borrowed
//! from a libudev object outlives it.

use super::handle::RefCounted;
use super::registry::Registry;
use libudev_sys as ffi;
use std::ffi::{CStr, CString};
use std::io;
use std::os::raw::c_char;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

macro_rules! ref_counted {
    ($type:ty, $add_ref:path, $release:path) => {
        impl RefCounted for $type {
            unsafe fn add_ref(ptr: NonNull<Self>) {
                $add_ref(ptr.as_ptr());
            }

            unsafe fn release(ptr: NonNull<Self>) {
                $release(ptr.as_ptr());
            }
        }
    };
}

ref_counted!(ffi::udev, ffi::udev_ref, ffi::udev_unref);
ref_counted!(ffi::udev_enumerate, ffi::udev_enumerate_ref, ffi::udev_enumerate_unref);
ref_counted!(ffi::udev_monitor, ffi::udev_monitor_ref, ffi::udev_monitor_unref);
ref_counted!(ffi::udev_device, ffi::udev_device_ref, ffi::udev_device_unref);

/// The system device registry
#[derive(Debug, Clone, Copy, Default)]
pub struct Libudev;

impl Libudev {
    pub fn new() -> Self {
        Libudev
    }
}

fn c_string(value: &str) -> io::Result<CString> {
    CString::new(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Copy a string owned by libudev
unsafe fn copy_str(raw: *const c_char) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    Some(CStr::from_ptr(raw).to_string_lossy().into_owned())
}

/// libudev reports failure as a negative errno
fn check(code: i32) -> io::Result<()> {
    if code < 0 {
        Err(io::Error::from_raw_os_error(-code))
    } else {
        Ok(())
    }
}

impl Registry for Libudev {
    type Context = ffi::udev;
    type Enumerate = ffi::udev_enumerate;
    type Monitor = ffi::udev_monitor;
    type Device = ffi::udev_device;

    fn backend_name(&self) -> &'static str {
        "libudev"
    }

    fn context_new(&self) -> *mut ffi::udev {
        unsafe { ffi::udev_new() }
    }

    unsafe fn enumerate_new(&self, context: NonNull<ffi::udev>) -> *mut ffi::udev_enumerate {
        ffi::udev_enumerate_new(context.as_ptr())
    }

    unsafe fn enumerate_add_match_subsystem(
        &self,
        enumerate: NonNull<ffi::udev_enumerate>,
        subsystem: &str,
    ) -> io::Result<()> {
        let subsystem = c_string(subsystem)?;
        check(ffi::udev_enumerate_add_match_subsystem(
            enumerate.as_ptr(),
            subsystem.as_ptr(),
        ))
    }

    unsafe fn enumerate_add_match_property(
        &self,
        enumerate: NonNull<ffi::udev_enumerate>,
        key: &str,
        value: &str,
    ) -> io::Result<()> {
        let key = c_string(key)?;
        let value = c_string(value)?;
        check(ffi::udev_enumerate_add_match_property(
            enumerate.as_ptr(),
            key.as_ptr(),
            value.as_ptr(),
        ))
    }

    unsafe fn enumerate_scan_devices(&self, enumerate: NonNull<ffi::udev_enumerate>) -> io::Result<()> {
        check(ffi::udev_enumerate_scan_devices(enumerate.as_ptr()))
    }

    unsafe fn enumerate_syspaths(&self, enumerate: NonNull<ffi::udev_enumerate>) -> Vec<String> {
        let mut syspaths = Vec::new();
        let mut entry = ffi::udev_enumerate_get_list_entry(enumerate.as_ptr());
        while !entry.is_null() {
            if let Some(name) = copy_str(ffi::udev_list_entry_get_name(entry)) {
                syspaths.push(name);
            }
            entry = ffi::udev_list_entry_get_next(entry);
        }
        syspaths
    }

    unsafe fn device_new_from_syspath(
        &self,
        context: NonNull<ffi::udev>,
        syspath: &str,
    ) -> *mut ffi::udev_device {
        match c_string(syspath) {
            Ok(syspath) => ffi::udev_device_new_from_syspath(context.as_ptr(), syspath.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn device_parent(&self, device: NonNull<ffi::udev_device>) -> *mut ffi::udev_device {
        ffi::udev_device_get_parent(device.as_ptr())
    }

    unsafe fn device_property(&self, device: NonNull<ffi::udev_device>, key: &str) -> Option<String> {
        let key = c_string(key).ok()?;
        copy_str(ffi::udev_device_get_property_value(
            device.as_ptr(),
            key.as_ptr(),
        ))
    }

    unsafe fn device_sysname(&self, device: NonNull<ffi::udev_device>) -> Option<String> {
        copy_str(ffi::udev_device_get_sysname(device.as_ptr()))
    }

    unsafe fn device_devpath(&self, device: NonNull<ffi::udev_device>) -> Option<String> {
        copy_str(ffi::udev_device_get_devpath(device.as_ptr()))
    }

    unsafe fn device_syspath(&self, device: NonNull<ffi::udev_device>) -> Option<String> {
        copy_str(ffi::udev_device_get_syspath(device.as_ptr()))
    }

    unsafe fn device_subsystem(&self, device: NonNull<ffi::udev_device>) -> Option<String> {
        copy_str(ffi::udev_device_get_subsystem(device.as_ptr()))
    }

    unsafe fn device_action(&self, device: NonNull<ffi::udev_device>) -> Option<String> {
        copy_str(ffi::udev_device_get_action(device.as_ptr()))
    }

    unsafe fn monitor_new(&self, context: NonNull<ffi::udev>, source: &str) -> *mut ffi::udev_monitor {
        match c_string(source) {
            Ok(source) => ffi::udev_monitor_new_from_netlink(context.as_ptr(), source.as_ptr()),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn monitor_add_match(
        &self,
        monitor: NonNull<ffi::udev_monitor>,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> io::Result<()> {
        let subsystem = c_string(subsystem)?;
        let devtype = devtype.map(c_string).transpose()?;
        check(ffi::udev_monitor_filter_add_match_subsystem_devtype(
            monitor.as_ptr(),
            subsystem.as_ptr(),
            devtype.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
        ))
    }

    unsafe fn monitor_enable(&self, monitor: NonNull<ffi::udev_monitor>) -> io::Result<()> {
        check(ffi::udev_monitor_enable_receiving(monitor.as_ptr()))
    }

    unsafe fn monitor_fd(&self, monitor: NonNull<ffi::udev_monitor>) -> RawFd {
        ffi::udev_monitor_get_fd(monitor.as_ptr())
    }

    unsafe fn monitor_receive(
        &self,
        monitor: NonNull<ffi::udev_monitor>,
    ) -> io::Result<*mut ffi::udev_device> {
        // A null result only carries meaning through errno
        *libc::__errno_location() = 0;
        let device = ffi::udev_monitor_receive_device(monitor.as_ptr());
        if !device.is_null() {
            return Ok(device);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            None | Some(0) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(ptr::null_mut()),
            #[allow(unreachable_patterns)]
            Some(libc::EWOULDBLOCK) => Ok(ptr::null_mut()),
            Some(_) => Err(err),
        }
    }
}
