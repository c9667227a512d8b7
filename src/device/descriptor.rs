//! Device objects and descriptors
//!
//! [`Device`] owns one reference to a registry device. [`ParentRef`] is the
//! borrowed view the registry hands out for parent lookups. [`Descriptor`] is
//! what the enumerator and the monitor produce: a device node, its physical
//! parent (retained, so the descriptor can be kept around) and, for monitor
//! events, the action.

use super::handle::{Borrowed, Handle};
use super::registry::{Context, Registry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;

/// Typed accessors over a device's string-keyed property store
///
/// Every query goes to the registry; nothing is cached, and a missing value is
/// `None` rather than an error.
pub trait DeviceAttributes<R: Registry> {
    /// Registry that owns the device
    fn registry(&self) -> &R;

    /// Raw device pointer, valid while `self` is alive
    fn as_non_null(&self) -> NonNull<R::Device>;

    /// Value of the property `key`
    fn property(&self, key: &str) -> Option<String> {
        unsafe { self.registry().device_property(self.as_non_null(), key) }
    }

    /// Short kernel name, e.g. `event3`
    fn sys_name(&self) -> Option<String> {
        unsafe { self.registry().device_sysname(self.as_non_null()) }
    }

    /// Registry path, e.g. `/devices/platform/i8042/serio1/input/input5`
    fn devpath(&self) -> Option<String> {
        unsafe { self.registry().device_devpath(self.as_non_null()) }
    }

    /// Full sysfs path
    fn syspath(&self) -> Option<String> {
        unsafe { self.registry().device_syspath(self.as_non_null()) }
    }

    /// Subsystem name, e.g. `input`
    fn subsystem(&self) -> Option<String> {
        unsafe { self.registry().device_subsystem(self.as_non_null()) }
    }
}

/// Owned reference to a registry device
///
/// Holds a reference to the context it was opened from, so the device is
/// always released before its context.
pub struct Device<R: Registry> {
    // Must drop before `context`.
    handle: Handle<R::Device>,
    ptr: NonNull<R::Device>,
    context: Context<R>,
}

impl<R: Registry> Device<R> {
    /// Adopt a device pointer that already carries a reference.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live device opened from `context` whose
    /// reference is transferred to the result.
    pub unsafe fn from_owned_raw(context: &Context<R>, raw: *mut R::Device) -> Option<Self> {
        let handle = Handle::acquire(raw);
        let ptr = handle.as_non_null().ok()?;
        Some(Self {
            handle,
            ptr,
            context: context.clone(),
        })
    }

    /// Borrowed view of the parent device, tied to this device's lifetime
    pub fn parent_ref(&self) -> Option<ParentRef<'_, R>> {
        let raw = unsafe { self.context.registry().device_parent(self.ptr) };
        let ptr = unsafe { Borrowed::new(raw) }?;
        Some(ParentRef {
            ptr,
            context: &self.context,
        })
    }

    /// The parent device with a reference of its own
    pub fn parent(&self) -> Option<Device<R>> {
        self.parent_ref().map(|parent| parent.to_owned())
    }

    /// Raw action string of a monitor event (`add`, `remove`, `change`, ...)
    pub fn action_name(&self) -> Option<String> {
        unsafe { self.context.registry().device_action(self.ptr) }
    }

    /// The underlying handle
    pub fn handle(&self) -> &Handle<R::Device> {
        &self.handle
    }

    /// The context the device was opened from
    pub fn context(&self) -> &Context<R> {
        &self.context
    }
}

impl<R: Registry> DeviceAttributes<R> for Device<R> {
    fn registry(&self) -> &R {
        self.context.registry()
    }

    fn as_non_null(&self) -> NonNull<R::Device> {
        self.ptr
    }
}

impl<R: Registry> Clone for Device<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            ptr: self.ptr,
            context: self.context.clone(),
        }
    }
}

impl<R: Registry> fmt::Debug for Device<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("syspath", &self.syspath())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Parent device as returned by the registry: borrowed from its child
///
/// No reference is taken. Call [`ParentRef::to_owned`] to keep the parent
/// beyond the child's lifetime.
pub struct ParentRef<'a, R: Registry> {
    ptr: Borrowed<'a, R::Device>,
    context: &'a Context<R>,
}

impl<'a, R: Registry> ParentRef<'a, R> {
    /// Take a reference so the parent can outlive its child
    pub fn to_owned(&self) -> Device<R> {
        let handle = self.ptr.to_owned();
        let ptr = self.ptr.as_non_null();
        Device {
            handle,
            ptr,
            context: self.context.clone(),
        }
    }
}

impl<R: Registry> DeviceAttributes<R> for ParentRef<'_, R> {
    fn registry(&self) -> &R {
        self.context.registry()
    }

    fn as_non_null(&self) -> NonNull<R::Device> {
        self.ptr.as_non_null()
    }
}

/// Kind of change reported by a monitor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Device appeared
    Added,
    /// Device went away
    Removed,
    /// Device properties changed
    Changed,
    /// Any other action (`bind`, `move`, ...) or none at all
    Unknown,
}

impl Action {
    /// Map a registry action string
    pub fn from_registry(action: Option<&str>) -> Self {
        match action {
            Some("add") => Action::Added,
            Some("remove") => Action::Removed,
            Some("change") => Action::Changed,
            _ => Action::Unknown,
        }
    }

    /// Past-tense word used in console output
    pub fn display_name(&self) -> &'static str {
        match self {
            Action::Added => "added",
            Action::Removed => "removed",
            Action::Changed => "changed",
            Action::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A device node produced by enumeration or monitoring, before classification
pub struct Descriptor<R: Registry> {
    device: Device<R>,
    parent: Option<Device<R>>,
    action: Option<Action>,
}

impl<R: Registry> Descriptor<R> {
    /// Descriptor for an enumerated node (no action)
    pub fn enumerated(device: Device<R>) -> Self {
        let parent = device.parent();
        Self {
            device,
            parent,
            action: None,
        }
    }

    /// Descriptor for a node received from a monitor
    pub fn monitored(device: Device<R>) -> Self {
        let action = Action::from_registry(device.action_name().as_deref());
        let parent = device.parent();
        Self {
            device,
            parent,
            action: Some(action),
        }
    }

    /// The node itself
    pub fn device(&self) -> &Device<R> {
        &self.device
    }

    /// The physical device this node belongs to
    pub fn parent(&self) -> Option<&Device<R>> {
        self.parent.as_ref()
    }

    /// Monitor action; `None` for enumerated nodes
    pub fn action(&self) -> Option<Action> {
        self.action
    }

    /// Raw action string as delivered by the registry
    pub fn action_name(&self) -> Option<String> {
        self.device.action_name()
    }

    /// Syspath of the node
    pub fn node_path(&self) -> Option<String> {
        self.device.syspath()
    }

    /// Short kernel name of the node
    pub fn sys_name(&self) -> Option<String> {
        self.device.sys_name()
    }

    /// Property of the node
    pub fn property(&self, key: &str) -> Option<String> {
        self.device.property(key)
    }

    /// Key identifying the physical device behind this node
    ///
    /// The parent's devpath; nodes without a parent stand for themselves.
    pub fn physical_key(&self) -> Option<String> {
        match &self.parent {
            Some(parent) => parent.devpath().or_else(|| parent.syspath()),
            None => self.device.devpath().or_else(|| self.device.syspath()),
        }
    }
}

impl<R: Registry> fmt::Debug for Descriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("node_path", &self.node_path())
            .field("sys_name", &self.sys_name())
            .field("parent", &self.parent.as_ref().and_then(|p| p.devpath()))
            .field("action", &self.action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::registry::Context;
    use crate::testdb::{MockRegistry, NodeSpec};

    fn registry_with_mouse() -> MockRegistry {
        let registry = MockRegistry::new();
        registry.add_node(
            NodeSpec::new("/sys/devices/m1", "input5", "input").with_property("NAME", "Logi Mouse"),
        );
        registry.add_node(
            NodeSpec::new("/sys/devices/m1/event3", "event3", "input")
                .with_parent("/sys/devices/m1")
                .with_property("ID_INPUT_MOUSE", "1"),
        );
        registry
    }

    #[test]
    fn test_action_mapping() {
        assert_eq!(Action::from_registry(Some("add")), Action::Added);
        assert_eq!(Action::from_registry(Some("remove")), Action::Removed);
        assert_eq!(Action::from_registry(Some("change")), Action::Changed);
        assert_eq!(Action::from_registry(Some("bind")), Action::Unknown);
        assert_eq!(Action::from_registry(None), Action::Unknown);
        assert_eq!(Action::Added.to_string(), "added");
    }

    #[test]
    fn test_device_attributes() {
        let registry = registry_with_mouse();
        let context = Context::open(&registry).unwrap();
        let device = context
            .device_from_syspath("/sys/devices/m1/event3")
            .unwrap();

        assert_eq!(device.sys_name().as_deref(), Some("event3"));
        assert_eq!(device.devpath().as_deref(), Some("/devices/m1/event3"));
        assert_eq!(device.subsystem().as_deref(), Some("input"));
        assert_eq!(device.property("ID_INPUT_MOUSE").as_deref(), Some("1"));
        assert_eq!(device.property("ID_INPUT_TOUCHPAD"), None);
        assert_eq!(device.action_name(), None);
    }

    #[test]
    fn test_parent_ref_is_borrowed() {
        let registry = registry_with_mouse();
        let context = Context::open(&registry).unwrap();
        let device = context
            .device_from_syspath("/sys/devices/m1/event3")
            .unwrap();

        let before = registry.ledger();
        {
            let parent = device.parent_ref().unwrap();
            assert_eq!(parent.property("NAME").as_deref(), Some("Logi Mouse"));
        }
        // Materialising the parent allocates it, but hands out no reference
        let after = registry.ledger();
        assert_eq!(after.increments, before.increments);
        assert_eq!(after.allocations, before.allocations + 1);
    }

    #[test]
    fn test_owned_parent_outlives_child() {
        let registry = registry_with_mouse();
        let context = Context::open(&registry).unwrap();
        let device = context
            .device_from_syspath("/sys/devices/m1/event3")
            .unwrap();
        let parent = device.parent().unwrap();

        drop(device);
        assert_eq!(parent.devpath().as_deref(), Some("/devices/m1"));
        assert_eq!(parent.property("NAME").as_deref(), Some("Logi Mouse"));

        drop(parent);
        drop(context);
        let ledger = registry.ledger();
        assert_eq!(ledger.live(), 0);
        assert!(ledger.is_clean());
    }

    #[test]
    fn test_device_keeps_its_context() {
        let registry = registry_with_mouse();
        let device = {
            let context = Context::open(&registry).unwrap();
            context
                .device_from_syspath("/sys/devices/m1/event3")
                .unwrap()
        };

        // The context outlives the handle it was opened through
        assert!(device.context().is_open());
        assert_eq!(registry.ledger().live(), 2);
        assert_eq!(device.sys_name().as_deref(), Some("event3"));

        let descriptor = Descriptor::enumerated(device);
        assert!(descriptor.parent().unwrap().context().is_open());

        drop(descriptor);
        let ledger = registry.ledger();
        assert_eq!(ledger.live(), 0);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_descriptor_physical_key() {
        let registry = registry_with_mouse();
        let context = Context::open(&registry).unwrap();

        let node = context
            .device_from_syspath("/sys/devices/m1/event3")
            .unwrap();
        let descriptor = Descriptor::enumerated(node);
        assert_eq!(descriptor.physical_key().as_deref(), Some("/devices/m1"));
        assert_eq!(descriptor.action(), None);

        let orphan = context.device_from_syspath("/sys/devices/m1").unwrap();
        let descriptor = Descriptor::enumerated(orphan);
        assert!(descriptor.parent().is_none());
        assert_eq!(descriptor.physical_key().as_deref(), Some("/devices/m1"));
    }
}
