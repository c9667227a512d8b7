//! In-memory device registry for testing without real hardware
//!
//! [`MockRegistry`] implements [`Registry`] over a simulated device tree. It
//! behaves like libudev where the crate relies on it:
//!
//! - every object carries its own reference count and is released when the
//!   count reaches zero;
//! - a child device owns the only reference to its parent, so parent lookups
//!   return borrowed pointers;
//! - monitors deliver one datagram per event on a socket whose receiving end
//!   is the readiness descriptor.
//!
//! Released objects are kept in an arena until the registry itself goes away,
//! so a reference-count bug shows up in the [`LedgerSnapshot`] instead of as
//! memory corruption.

use crate::device::handle::RefCounted;
use crate::device::registry::Registry;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::ptr::{self, NonNull};
use std::rc::Rc;

/// A device node in the simulated registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Full sysfs path, e.g. `/sys/devices/m1/input/input5/event3`
    pub syspath: String,
    /// Short kernel name, e.g. `event3`
    pub sys_name: String,
    /// Subsystem, e.g. `input`
    pub subsystem: String,
    /// Device type within the subsystem
    #[serde(default)]
    pub devtype: Option<String>,
    /// Syspath of the parent node
    #[serde(default)]
    pub parent: Option<String>,
    /// Device properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl NodeSpec {
    /// Create a node without parent or properties
    pub fn new(syspath: &str, sys_name: &str, subsystem: &str) -> Self {
        Self {
            syspath: syspath.to_string(),
            sys_name: sys_name.to_string(),
            subsystem: subsystem.to_string(),
            devtype: None,
            parent: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the parent syspath
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the device type
    pub fn with_devtype(mut self, devtype: &str) -> Self {
        self.devtype = Some(devtype.to_string());
        self
    }

    /// Registry path: the syspath without the `/sys` mount point
    pub fn devpath(&self) -> String {
        self.syspath
            .strip_prefix("/sys")
            .unwrap_or(&self.syspath)
            .to_string()
    }
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get() + 1);
}

#[derive(Debug, Default)]
struct Ledger {
    allocations: Cell<usize>,
    increments: Cell<usize>,
    releases: Cell<usize>,
    frees: Cell<usize>,
    over_releases: Cell<usize>,
    stale_accesses: Cell<usize>,
}

/// Reference counting activity of a [`MockRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    /// Objects created (each starts with one reference)
    pub allocations: usize,
    /// References taken on existing objects
    pub increments: usize,
    /// References given back
    pub releases: usize,
    /// Objects whose count reached zero
    pub frees: usize,
    /// Releases of objects that were already freed
    pub over_releases: usize,
    /// Uses of objects that were already freed
    pub stale_accesses: usize,
}

impl LedgerSnapshot {
    /// Objects that are still referenced
    pub fn live(&self) -> usize {
        self.allocations - self.frees
    }

    /// No object was released too often or used after being freed
    pub fn is_clean(&self) -> bool {
        self.over_releases == 0 && self.stale_accesses == 0
    }

    /// Every reference ever handed out has been given back exactly once
    pub fn is_balanced(&self) -> bool {
        self.is_clean()
            && self.live() == 0
            && self.allocations + self.increments == self.releases
    }
}

/// Reference count shared by every simulated object
#[derive(Debug)]
struct Header {
    refs: Cell<usize>,
    freed: Cell<bool>,
    ledger: Rc<Ledger>,
}

impl Header {
    fn new(ledger: &Rc<Ledger>) -> Self {
        bump(&ledger.allocations);
        Self {
            refs: Cell::new(1),
            freed: Cell::new(false),
            ledger: Rc::clone(ledger),
        }
    }

    fn add_ref(&self) {
        if self.freed.get() {
            bump(&self.ledger.stale_accesses);
            return;
        }
        self.refs.set(self.refs.get() + 1);
        bump(&self.ledger.increments);
    }

    /// Returns true when this release freed the object
    fn release(&self) -> bool {
        if self.freed.get() {
            bump(&self.ledger.over_releases);
            return false;
        }
        bump(&self.ledger.releases);
        let left = self.refs.get() - 1;
        self.refs.set(left);
        if left == 0 {
            self.freed.set(true);
            bump(&self.ledger.frees);
            return true;
        }
        false
    }

    /// Check the object may be used, recording a stale access otherwise
    fn check(&self) -> bool {
        if self.freed.get() {
            bump(&self.ledger.stale_accesses);
            return false;
        }
        true
    }
}

/// Simulated library context
#[derive(Debug)]
pub struct MockContext {
    header: Header,
}

/// Simulated enumeration context
#[derive(Debug)]
pub struct MockEnumerate {
    header: Header,
    subsystems: RefCell<Vec<String>>,
    properties: RefCell<Vec<(String, String)>>,
    results: RefCell<Vec<String>>,
}

/// Simulated device object
#[derive(Debug)]
pub struct MockDevice {
    header: Header,
    node: NodeSpec,
    action: Option<String>,
    parent: Cell<*mut MockDevice>,
}

/// Simulated event monitor
#[derive(Debug)]
pub struct MockMonitor {
    header: Header,
    source: String,
    filters: RefCell<Vec<(String, Option<String>)>>,
    enabled: Cell<bool>,
    // One entry per datagram; `None` is a datagram that carries no device
    queue: RefCell<VecDeque<Option<(String, NodeSpec)>>>,
    fail_next: Cell<bool>,
    sender: UnixDatagram,
    receiver: UnixDatagram,
}

impl MockMonitor {
    fn accepts(&self, node: &NodeSpec) -> bool {
        let filters = self.filters.borrow();
        filters.is_empty()
            || filters.iter().any(|(subsystem, devtype)| {
                *subsystem == node.subsystem
                    && devtype
                        .as_deref()
                        .map_or(true, |devtype| node.devtype.as_deref() == Some(devtype))
            })
    }

    fn push(&self, event: Option<(String, NodeSpec)>) {
        self.queue.borrow_mut().push_back(event);
        if let Err(e) = self.sender.send(&[1]) {
            debug!("Could not signal mock monitor: {}", e);
        }
    }
}

impl RefCounted for MockContext {
    unsafe fn add_ref(ptr: NonNull<Self>) {
        ptr.as_ref().header.add_ref();
    }

    unsafe fn release(ptr: NonNull<Self>) {
        ptr.as_ref().header.release();
    }
}

impl RefCounted for MockEnumerate {
    unsafe fn add_ref(ptr: NonNull<Self>) {
        ptr.as_ref().header.add_ref();
    }

    unsafe fn release(ptr: NonNull<Self>) {
        if ptr.as_ref().header.release() {
            ptr.as_ref().results.borrow_mut().clear();
        }
    }
}

impl RefCounted for MockDevice {
    unsafe fn add_ref(ptr: NonNull<Self>) {
        ptr.as_ref().header.add_ref();
    }

    unsafe fn release(ptr: NonNull<Self>) {
        let device = ptr.as_ref();
        if device.header.release() {
            // The child owned its parent's only reference
            if let Some(parent) = NonNull::new(device.parent.replace(ptr::null_mut())) {
                MockDevice::release(parent);
            }
        }
    }
}

impl RefCounted for MockMonitor {
    unsafe fn add_ref(ptr: NonNull<Self>) {
        ptr.as_ref().header.add_ref();
    }

    unsafe fn release(ptr: NonNull<Self>) {
        let monitor = ptr.as_ref();
        if monitor.header.release() {
            monitor.enabled.set(false);
            monitor.queue.borrow_mut().clear();
        }
    }
}

enum Allocation {
    Context(NonNull<MockContext>),
    Enumerate(NonNull<MockEnumerate>),
    Monitor(NonNull<MockMonitor>),
    Device(NonNull<MockDevice>),
}

struct World {
    ledger: Rc<Ledger>,
    nodes: RefCell<Vec<NodeSpec>>,
    arena: RefCell<Vec<Allocation>>,
    monitors: RefCell<Vec<NonNull<MockMonitor>>>,
    fail_context: Cell<bool>,
}

impl World {
    fn alloc<T>(&self, value: T, wrap: fn(NonNull<T>) -> Allocation) -> NonNull<T> {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        self.arena.borrow_mut().push(wrap(ptr));
        ptr
    }

    fn node(&self, syspath: &str) -> Option<NodeSpec> {
        self.nodes
            .borrow()
            .iter()
            .find(|node| node.syspath == syspath)
            .cloned()
    }

    fn new_device(&self, node: NodeSpec, action: Option<String>) -> NonNull<MockDevice> {
        self.alloc(
            MockDevice {
                header: Header::new(&self.ledger),
                node,
                action,
                parent: Cell::new(ptr::null_mut()),
            },
            Allocation::Device,
        )
    }
}

impl Drop for World {
    fn drop(&mut self) {
        for allocation in self.arena.get_mut().drain(..) {
            unsafe {
                match allocation {
                    Allocation::Context(ptr) => drop(Box::from_raw(ptr.as_ptr())),
                    Allocation::Enumerate(ptr) => drop(Box::from_raw(ptr.as_ptr())),
                    Allocation::Monitor(ptr) => drop(Box::from_raw(ptr.as_ptr())),
                    Allocation::Device(ptr) => drop(Box::from_raw(ptr.as_ptr())),
                }
            }
        }
    }
}

/// In-memory device registry
///
/// Cloning is cheap; clones share the same simulated device tree.
#[derive(Clone)]
pub struct MockRegistry {
    world: Rc<World>,
}

impl MockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            world: Rc::new(World {
                ledger: Rc::new(Ledger::default()),
                nodes: RefCell::new(Vec::new()),
                arena: RefCell::new(Vec::new()),
                monitors: RefCell::new(Vec::new()),
                fail_context: Cell::new(false),
            }),
        }
    }

    /// Create a registry holding the given nodes, listed in that order
    pub fn with_nodes<I: IntoIterator<Item = NodeSpec>>(nodes: I) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.add_node(node);
        }
        registry
    }

    /// Add a node, replacing any node with the same syspath
    pub fn add_node(&self, node: NodeSpec) {
        let mut nodes = self.world.nodes.borrow_mut();
        match nodes.iter_mut().find(|n| n.syspath == node.syspath) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }

    /// Remove a node; devices already opened keep their snapshot
    pub fn remove_node(&self, syspath: &str) -> Option<NodeSpec> {
        let mut nodes = self.world.nodes.borrow_mut();
        let index = nodes.iter().position(|n| n.syspath == syspath)?;
        Some(nodes.remove(index))
    }

    /// Look up a node
    pub fn node(&self, syspath: &str) -> Option<NodeSpec> {
        self.world.node(syspath)
    }

    /// All nodes in listing order
    pub fn nodes(&self) -> Vec<NodeSpec> {
        self.world.nodes.borrow().clone()
    }

    /// Permute the listing order deterministically
    pub fn shuffle_listing(&self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.world.nodes.borrow_mut().shuffle(&mut rng);
    }

    /// Make context creation fail, as on a system without the registry
    pub fn fail_context_creation(&self, fail: bool) {
        self.world.fail_context.set(fail);
    }

    /// Deliver an event for the node at `syspath` to every started monitor
    /// whose filters accept it. Returns the number of monitors reached.
    pub fn emit(&self, action: &str, syspath: &str) -> usize {
        let Some(node) = self.world.node(syspath) else {
            debug!("Not emitting '{}' for unknown node {}", action, syspath);
            return 0;
        };

        let mut delivered = 0;
        for monitor in self.live_monitors() {
            let monitor = unsafe { monitor.as_ref() };
            if monitor.accepts(&node) {
                monitor.push(Some((action.to_string(), node.clone())));
                delivered += 1;
            }
        }
        trace!("Emitted '{}' for {} to {} monitor(s)", action, syspath, delivered);
        delivered
    }

    /// Wake every started monitor with a datagram that carries no device
    pub fn emit_spurious(&self) -> usize {
        let monitors = self.live_monitors();
        for monitor in &monitors {
            unsafe { monitor.as_ref() }.push(None);
        }
        monitors.len()
    }

    /// Make the next receive on every monitor fail with a socket error
    pub fn fail_next_receive(&self) {
        for monitor in self.live_monitors() {
            unsafe { monitor.as_ref() }.fail_next.set(true);
        }
    }

    /// Events queued but not yet received, summed over all monitors
    pub fn pending_events(&self) -> usize {
        self.live_monitors()
            .iter()
            .map(|monitor| unsafe { monitor.as_ref() }.queue.borrow().len())
            .sum()
    }

    /// Current reference counting activity
    pub fn ledger(&self) -> LedgerSnapshot {
        let ledger = &self.world.ledger;
        LedgerSnapshot {
            allocations: ledger.allocations.get(),
            increments: ledger.increments.get(),
            releases: ledger.releases.get(),
            frees: ledger.frees.get(),
            over_releases: ledger.over_releases.get(),
            stale_accesses: ledger.stale_accesses.get(),
        }
    }

    fn live_monitors(&self) -> Vec<NonNull<MockMonitor>> {
        self.world
            .monitors
            .borrow()
            .iter()
            .copied()
            .filter(|monitor| {
                let monitor = unsafe { monitor.as_ref() };
                !monitor.header.freed.get() && monitor.enabled.get()
            })
            .collect()
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRegistry")
            .field("nodes", &self.world.nodes.borrow().len())
            .field("ledger", &self.ledger())
            .finish()
    }
}

fn stale_object() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "registry object already released")
}

impl Registry for MockRegistry {
    type Context = MockContext;
    type Enumerate = MockEnumerate;
    type Monitor = MockMonitor;
    type Device = MockDevice;

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }

    fn context_new(&self) -> *mut MockContext {
        if self.world.fail_context.get() {
            return ptr::null_mut();
        }
        self.world
            .alloc(
                MockContext {
                    header: Header::new(&self.world.ledger),
                },
                Allocation::Context,
            )
            .as_ptr()
    }

    unsafe fn enumerate_new(&self, context: NonNull<MockContext>) -> *mut MockEnumerate {
        if !context.as_ref().header.check() {
            return ptr::null_mut();
        }
        self.world
            .alloc(
                MockEnumerate {
                    header: Header::new(&self.world.ledger),
                    subsystems: RefCell::new(Vec::new()),
                    properties: RefCell::new(Vec::new()),
                    results: RefCell::new(Vec::new()),
                },
                Allocation::Enumerate,
            )
            .as_ptr()
    }

    unsafe fn enumerate_add_match_subsystem(
        &self,
        enumerate: NonNull<MockEnumerate>,
        subsystem: &str,
    ) -> io::Result<()> {
        let enumerate = enumerate.as_ref();
        if !enumerate.header.check() {
            return Err(stale_object());
        }
        enumerate.subsystems.borrow_mut().push(subsystem.to_string());
        Ok(())
    }

    unsafe fn enumerate_add_match_property(
        &self,
        enumerate: NonNull<MockEnumerate>,
        key: &str,
        value: &str,
    ) -> io::Result<()> {
        let enumerate = enumerate.as_ref();
        if !enumerate.header.check() {
            return Err(stale_object());
        }
        enumerate
            .properties
            .borrow_mut()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    unsafe fn enumerate_scan_devices(&self, enumerate: NonNull<MockEnumerate>) -> io::Result<()> {
        let enumerate = enumerate.as_ref();
        if !enumerate.header.check() {
            return Err(stale_object());
        }
        let subsystems = enumerate.subsystems.borrow();
        let properties = enumerate.properties.borrow();
        let results = self
            .world
            .nodes
            .borrow()
            .iter()
            .filter(|node| subsystems.iter().all(|s| *s == node.subsystem))
            .filter(|node| {
                properties
                    .iter()
                    .all(|(key, value)| node.properties.get(key) == Some(value))
            })
            .map(|node| node.syspath.clone())
            .collect();
        *enumerate.results.borrow_mut() = results;
        Ok(())
    }

    unsafe fn enumerate_syspaths(&self, enumerate: NonNull<MockEnumerate>) -> Vec<String> {
        let enumerate = enumerate.as_ref();
        if !enumerate.header.check() {
            return Vec::new();
        }
        enumerate.results.borrow().clone()
    }

    unsafe fn device_new_from_syspath(
        &self,
        context: NonNull<MockContext>,
        syspath: &str,
    ) -> *mut MockDevice {
        if !context.as_ref().header.check() {
            return ptr::null_mut();
        }
        match self.world.node(syspath) {
            Some(node) => self.world.new_device(node, None).as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn device_parent(&self, device: NonNull<MockDevice>) -> *mut MockDevice {
        let device = device.as_ref();
        if !device.header.check() {
            return ptr::null_mut();
        }
        let cached = device.parent.get();
        if !cached.is_null() {
            return cached;
        }
        let Some(parent) = device.node.parent.as_deref().and_then(|p| self.world.node(p)) else {
            return ptr::null_mut();
        };
        let parent = self.world.new_device(parent, None).as_ptr();
        device.parent.set(parent);
        parent
    }

    unsafe fn device_property(&self, device: NonNull<MockDevice>, key: &str) -> Option<String> {
        let device = device.as_ref();
        if !device.header.check() {
            return None;
        }
        device.node.properties.get(key).cloned()
    }

    unsafe fn device_sysname(&self, device: NonNull<MockDevice>) -> Option<String> {
        let device = device.as_ref();
        device.header.check().then(|| device.node.sys_name.clone())
    }

    unsafe fn device_devpath(&self, device: NonNull<MockDevice>) -> Option<String> {
        let device = device.as_ref();
        device.header.check().then(|| device.node.devpath())
    }

    unsafe fn device_syspath(&self, device: NonNull<MockDevice>) -> Option<String> {
        let device = device.as_ref();
        device.header.check().then(|| device.node.syspath.clone())
    }

    unsafe fn device_subsystem(&self, device: NonNull<MockDevice>) -> Option<String> {
        let device = device.as_ref();
        device.header.check().then(|| device.node.subsystem.clone())
    }

    unsafe fn device_action(&self, device: NonNull<MockDevice>) -> Option<String> {
        let device = device.as_ref();
        if !device.header.check() {
            return None;
        }
        device.action.clone()
    }

    unsafe fn monitor_new(&self, context: NonNull<MockContext>, source: &str) -> *mut MockMonitor {
        if !context.as_ref().header.check() {
            return ptr::null_mut();
        }
        let (sender, receiver) = match UnixDatagram::pair() {
            Ok(pair) => pair,
            Err(e) => {
                debug!("Could not create mock monitor socket: {}", e);
                return ptr::null_mut();
            }
        };
        if sender.set_nonblocking(true).is_err() || receiver.set_nonblocking(true).is_err() {
            return ptr::null_mut();
        }

        let monitor = self.world.alloc(
            MockMonitor {
                header: Header::new(&self.world.ledger),
                source: source.to_string(),
                filters: RefCell::new(Vec::new()),
                enabled: Cell::new(false),
                queue: RefCell::new(VecDeque::new()),
                fail_next: Cell::new(false),
                sender,
                receiver,
            },
            Allocation::Monitor,
        );
        self.world.monitors.borrow_mut().push(monitor);
        trace!("Created mock monitor on '{}'", source);
        monitor.as_ptr()
    }

    unsafe fn monitor_add_match(
        &self,
        monitor: NonNull<MockMonitor>,
        subsystem: &str,
        devtype: Option<&str>,
    ) -> io::Result<()> {
        let monitor = monitor.as_ref();
        if !monitor.header.check() {
            return Err(stale_object());
        }
        monitor
            .filters
            .borrow_mut()
            .push((subsystem.to_string(), devtype.map(str::to_string)));
        Ok(())
    }

    unsafe fn monitor_enable(&self, monitor: NonNull<MockMonitor>) -> io::Result<()> {
        let monitor = monitor.as_ref();
        if !monitor.header.check() {
            return Err(stale_object());
        }
        monitor.enabled.set(true);
        debug!("Mock monitor on '{}' receiving", monitor.source);
        Ok(())
    }

    unsafe fn monitor_fd(&self, monitor: NonNull<MockMonitor>) -> RawFd {
        let monitor = monitor.as_ref();
        if !monitor.header.check() {
            return -1;
        }
        monitor.receiver.as_raw_fd()
    }

    unsafe fn monitor_receive(&self, monitor: NonNull<MockMonitor>) -> io::Result<*mut MockDevice> {
        let monitor = monitor.as_ref();
        if !monitor.header.check() {
            return Err(stale_object());
        }
        if monitor.fail_next.replace(false) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated monitor socket failure",
            ));
        }

        let mut datagram = [0u8; 1];
        match monitor.receiver.recv(&mut datagram) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ptr::null_mut()),
            Err(e) => return Err(e),
        }

        let event = monitor.queue.borrow_mut().pop_front().flatten();
        Ok(match event {
            Some((action, node)) => self.world.new_device(node, Some(action)).as_ptr(),
            None => ptr::null_mut(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::handle::Handle;

    fn mouse_nodes() -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("/sys/devices/m1", "input5", "input").with_property("NAME", "Mouse"),
            NodeSpec::new("/sys/devices/m1/mouse0", "mouse0", "input")
                .with_parent("/sys/devices/m1")
                .with_property("ID_INPUT_MOUSE", "1"),
            NodeSpec::new("/sys/devices/k1/event0", "event0", "input")
                .with_property("ID_INPUT_KEYBOARD", "1"),
            NodeSpec::new("/sys/devices/usb1", "usb1", "usb").with_devtype("usb_device"),
        ]
    }

    #[test]
    fn test_node_spec_devpath() {
        let node = NodeSpec::new("/sys/devices/m1/event3", "event3", "input");
        assert_eq!(node.devpath(), "/devices/m1/event3");

        let bare = NodeSpec::new("/devices/m1", "m1", "input");
        assert_eq!(bare.devpath(), "/devices/m1");
    }

    #[test]
    fn test_add_node_replaces_same_syspath() {
        let registry = MockRegistry::with_nodes(mouse_nodes());
        registry.add_node(NodeSpec::new("/sys/devices/usb1", "usb1", "usb"));
        assert_eq!(registry.nodes().len(), 4);
        assert_eq!(registry.node("/sys/devices/usb1").unwrap().devtype, None);
    }

    #[test]
    fn test_scan_filters_are_conjunctive() {
        let registry = MockRegistry::with_nodes(mouse_nodes());
        unsafe {
            let context = Handle::acquire(registry.context_new());
            let enumerate =
                Handle::acquire(registry.enumerate_new(context.as_non_null().unwrap()));
            let e = enumerate.as_non_null().unwrap();

            registry.enumerate_add_match_subsystem(e, "input").unwrap();
            registry.enumerate_scan_devices(e).unwrap();
            assert_eq!(registry.enumerate_syspaths(e).len(), 3);

            registry
                .enumerate_add_match_property(e, "ID_INPUT_MOUSE", "1")
                .unwrap();
            registry.enumerate_scan_devices(e).unwrap();
            assert_eq!(
                registry.enumerate_syspaths(e),
                vec!["/sys/devices/m1/mouse0".to_string()]
            );
        }
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_child_owns_parent_reference() {
        let registry = MockRegistry::with_nodes(mouse_nodes());
        unsafe {
            let context = Handle::acquire(registry.context_new());
            let child = registry
                .device_new_from_syspath(context.as_non_null().unwrap(), "/sys/devices/m1/mouse0");
            let child = NonNull::new(child).unwrap();

            let parent = registry.device_parent(child);
            assert!(!parent.is_null());
            // Second lookup returns the same borrowed object
            assert_eq!(registry.device_parent(child), parent);
            assert_eq!(registry.ledger().live(), 3);

            MockDevice::release(child);
            assert_eq!(registry.ledger().live(), 1);
        }
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_over_release_is_recorded() {
        let registry = MockRegistry::new();
        unsafe {
            let context = NonNull::new(registry.context_new()).unwrap();
            MockContext::release(context);
            MockContext::release(context);
            assert!(registry.enumerate_new(context).is_null());
        }
        let ledger = registry.ledger();
        assert_eq!(ledger.over_releases, 1);
        assert_eq!(ledger.stale_accesses, 1);
        assert!(!ledger.is_clean());
    }

    #[test]
    fn test_monitor_datagrams_follow_events() {
        let registry = MockRegistry::with_nodes(mouse_nodes());
        unsafe {
            let context = Handle::acquire(registry.context_new());
            let monitor =
                Handle::acquire(registry.monitor_new(context.as_non_null().unwrap(), "udev"));
            let m = monitor.as_non_null().unwrap();
            registry.monitor_add_match(m, "input", None).unwrap();

            // Not started yet: nothing is delivered
            assert_eq!(registry.emit("add", "/sys/devices/m1/mouse0"), 0);

            registry.monitor_enable(m).unwrap();
            assert!(registry.monitor_fd(m) >= 0);
            assert_eq!(registry.emit("add", "/sys/devices/usb1"), 0);
            assert_eq!(registry.emit("add", "/sys/devices/m1/mouse0"), 1);
            assert_eq!(registry.emit_spurious(), 1);
            assert_eq!(registry.pending_events(), 2);

            let device = Handle::acquire(registry.monitor_receive(m).unwrap());
            let d = device.as_non_null().unwrap();
            assert_eq!(registry.device_action(d).as_deref(), Some("add"));
            assert_eq!(registry.device_sysname(d).as_deref(), Some("mouse0"));

            assert!(registry.monitor_receive(m).unwrap().is_null());
            assert!(registry.monitor_receive(m).unwrap().is_null());

            registry.fail_next_receive();
            assert!(registry.monitor_receive(m).is_err());
        }
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_monitor_devtype_filter() {
        let registry = MockRegistry::with_nodes(mouse_nodes());
        unsafe {
            let context = Handle::acquire(registry.context_new());
            let monitor =
                Handle::acquire(registry.monitor_new(context.as_non_null().unwrap(), "udev"));
            let m = monitor.as_non_null().unwrap();
            registry
                .monitor_add_match(m, "usb", Some("usb_interface"))
                .unwrap();
            registry.monitor_enable(m).unwrap();

            assert_eq!(registry.emit("add", "/sys/devices/usb1"), 0);

            registry
                .monitor_add_match(m, "usb", Some("usb_device"))
                .unwrap();
            assert_eq!(registry.emit("add", "/sys/devices/usb1"), 1);
        }
    }

    #[test]
    fn test_shuffle_listing_is_deterministic() {
        let first = MockRegistry::with_nodes(mouse_nodes());
        let second = MockRegistry::with_nodes(mouse_nodes());
        first.shuffle_listing(7);
        second.shuffle_listing(7);
        assert_eq!(first.nodes(), second.nodes());
        assert_eq!(first.nodes().len(), 4);
    }
}
