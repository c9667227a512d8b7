//! Device registry abstraction
//!
//! [`Registry`] is the raw interface of a udev-like device database: contexts,
//! enumerators, monitors and device objects, each reference counted. Both the
//! libudev backend and the in-memory registry in `testdb` implement it, so the
//! enumerator, monitor and classifier work with either.
//!
//! The trait speaks raw pointers, the way the underlying C library does. The
//! safe layer ([`Context`], [`Device`](super::descriptor::Device),
//! [`Enumeration`](super::enumerator::Enumeration),
//! [`Monitor`](super::monitor::Monitor)) owns every pointer through a
//! [`Handle`] and is the only caller of these methods.

use super::descriptor::Device;
use super::handle::{Handle, RefCounted};
use crate::core::error::{Result, WatchError};
use log::trace;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Raw interface to a device registry
///
/// Pointers returned by `*_new` methods and by [`Registry::monitor_receive`]
/// carry one reference owned by the caller. [`Registry::device_parent`]
/// returns a borrowed pointer that lives as long as the child.
///
/// All `unsafe` methods require their pointer arguments to point to live
/// objects created by this registry.
pub trait Registry: Clone + 'static {
    /// Library context
    type Context: RefCounted;
    /// Enumeration context
    type Enumerate: RefCounted;
    /// Event monitor
    type Monitor: RefCounted;
    /// Device object
    type Device: RefCounted;

    /// Human-readable backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Open a new context carrying one reference; null on failure
    fn context_new(&self) -> *mut Self::Context;

    /// Create an enumeration context; null on failure
    unsafe fn enumerate_new(&self, context: NonNull<Self::Context>) -> *mut Self::Enumerate;

    /// Restrict the enumeration to a subsystem
    unsafe fn enumerate_add_match_subsystem(
        &self,
        enumerate: NonNull<Self::Enumerate>,
        subsystem: &str,
    ) -> io::Result<()>;

    /// Restrict the enumeration to devices whose property `key` equals `value`
    unsafe fn enumerate_add_match_property(
        &self,
        enumerate: NonNull<Self::Enumerate>,
        key: &str,
        value: &str,
    ) -> io::Result<()>;

    /// Scan the registry for devices matching every filter
    unsafe fn enumerate_scan_devices(&self, enumerate: NonNull<Self::Enumerate>)
        -> io::Result<()>;

    /// Syspaths found by the last scan, in registry order
    unsafe fn enumerate_syspaths(&self, enumerate: NonNull<Self::Enumerate>) -> Vec<String>;

    /// Open a device by syspath; null if it does not (or no longer) exist
    unsafe fn device_new_from_syspath(
        &self,
        context: NonNull<Self::Context>,
        syspath: &str,
    ) -> *mut Self::Device;

    /// Borrowed pointer to the parent device; null if there is none
    unsafe fn device_parent(&self, device: NonNull<Self::Device>) -> *mut Self::Device;

    /// Value of a device property
    unsafe fn device_property(&self, device: NonNull<Self::Device>, key: &str) -> Option<String>;

    /// Short kernel name (`event3`, `mouse0`, `input5`)
    unsafe fn device_sysname(&self, device: NonNull<Self::Device>) -> Option<String>;

    /// Registry path, without the sysfs mount point
    unsafe fn device_devpath(&self, device: NonNull<Self::Device>) -> Option<String>;

    /// Full sysfs path
    unsafe fn device_syspath(&self, device: NonNull<Self::Device>) -> Option<String>;

    /// Subsystem the device belongs to
    unsafe fn device_subsystem(&self, device: NonNull<Self::Device>) -> Option<String>;

    /// Action of a device received from a monitor; `None` otherwise
    unsafe fn device_action(&self, device: NonNull<Self::Device>) -> Option<String>;

    /// Create an event monitor on the given event source (`udev`/`kernel`); null on failure
    unsafe fn monitor_new(
        &self,
        context: NonNull<Self::Context>,
        source: &str,
    ) -> *mut Self::Monitor;

    /// Only deliver events for `subsystem` (and `devtype`, if given)
    unsafe fn monitor_add_match(
        &self,
        monitor: NonNull<Self::Monitor>,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> io::Result<()>;

    /// Bind the monitor and start receiving events
    unsafe fn monitor_enable(&self, monitor: NonNull<Self::Monitor>) -> io::Result<()>;

    /// Descriptor that becomes readable when an event is available
    unsafe fn monitor_fd(&self, monitor: NonNull<Self::Monitor>) -> RawFd;

    /// Receive the next event without blocking
    ///
    /// `Ok(null)` means nothing was available; `Err` is a transport failure.
    unsafe fn monitor_receive(
        &self,
        monitor: NonNull<Self::Monitor>,
    ) -> io::Result<*mut Self::Device>;
}

/// Owned registry context
///
/// Everything else is created from a context. Clones share the underlying
/// context through its reference count.
pub struct Context<R: Registry> {
    // Declared before `registry`: the handle must be released while the
    // registry that produced it is still alive.
    handle: Handle<R::Context>,
    registry: R,
}

impl<R: Registry> Context<R> {
    /// Open a context on the registry
    pub fn open(registry: &R) -> Result<Self> {
        let handle = unsafe { Handle::acquire(registry.context_new()) };
        if handle.is_empty() {
            return Err(WatchError::RegistryUnavailable(format!(
                "could not create a {} context",
                registry.backend_name()
            )));
        }

        trace!("Opened {} context", registry.backend_name());
        Ok(Self {
            handle,
            registry: registry.clone(),
        })
    }

    /// The registry this context belongs to
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Raw context pointer for registry calls
    pub fn as_non_null(&self) -> Result<NonNull<R::Context>> {
        self.handle.as_non_null()
    }

    /// Open the device at `syspath`
    ///
    /// Returns `None` when the device does not exist, which includes devices
    /// removed since they were listed.
    pub fn device_from_syspath(&self, syspath: &str) -> Option<Device<R>> {
        let context = self.handle.as_non_null().ok()?;
        let raw = unsafe { self.registry.device_new_from_syspath(context, syspath) };
        unsafe { Device::from_owned_raw(self, raw) }
    }

    /// Give back this context's reference
    ///
    /// Registry calls through a reset context fail with `NotPresent`; devices
    /// opened from it keep their own references.
    pub fn reset(&mut self) {
        self.handle.reset();
    }

    /// Whether the context still holds its reference
    pub fn is_open(&self) -> bool {
        self.handle.is_present()
    }
}

impl<R: Registry> Clone for Context<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<R: Registry> std::fmt::Debug for Context<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.registry.backend_name())
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::{MockRegistry, NodeSpec};

    #[test]
    fn test_open_context() {
        let registry = MockRegistry::new();
        let context = Context::open(&registry).unwrap();
        assert_eq!(registry.ledger().live(), 1);

        let copy = context.clone();
        assert_eq!(registry.ledger().increments, 1);

        drop(context);
        drop(copy);
        let ledger = registry.ledger();
        assert_eq!(ledger.live(), 0);
        assert!(ledger.is_clean());
    }

    #[test]
    fn test_open_context_failure() {
        let registry = MockRegistry::new();
        registry.fail_context_creation(true);

        let err = Context::open(&registry).unwrap_err();
        assert!(matches!(err, WatchError::RegistryUnavailable(_)));
        assert_eq!(registry.ledger().allocations, 0);
    }

    #[test]
    fn test_device_from_syspath() {
        let registry = MockRegistry::new();
        registry.add_node(NodeSpec::new("/sys/devices/m1/input5", "input5", "input"));

        let context = Context::open(&registry).unwrap();
        assert!(context
            .device_from_syspath("/sys/devices/m1/input5")
            .is_some());
        assert!(context.device_from_syspath("/sys/devices/nope").is_none());
    }
}
