//! Device enumeration with physical-device de-duplication
//!
//! One physical input device usually shows up as several kernel nodes
//! (`mouse0`, `event3`, ...) that share a parent. [`enumerate`] scans the
//! registry once and yields at most one [`Descriptor`] per physical device,
//! preferring the node whose `sys_name` starts with the canonical prefix.
//!
//! Canonical nodes are yielded as soon as they are seen. A physical device
//! with no canonical node in the listing is yielded after the listing is
//! exhausted, represented by the first node seen for it.

use super::descriptor::Descriptor;
use super::handle::Handle;
use super::registry::{Context, Registry};
use crate::core::error::{Result, WatchError};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Property set by udev on mouse-class input nodes
const MOUSE_PROPERTY: &str = "ID_INPUT_MOUSE";

/// Filters applied to a scan; all of them must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerateFilter {
    /// Subsystem to scan (`None` scans every subsystem)
    pub subsystem: Option<String>,
    /// Required property values
    pub properties: BTreeMap<String, String>,
}

impl Default for EnumerateFilter {
    fn default() -> Self {
        Self::mice()
    }
}

impl EnumerateFilter {
    /// No filtering at all
    pub fn any() -> Self {
        Self {
            subsystem: None,
            properties: BTreeMap::new(),
        }
    }

    /// Every node of a subsystem
    pub fn subsystem(subsystem: &str) -> Self {
        Self {
            subsystem: Some(subsystem.to_string()),
            properties: BTreeMap::new(),
        }
    }

    /// Mouse-class input nodes: `subsystem=input, ID_INPUT_MOUSE=1`
    pub fn mice() -> Self {
        Self::subsystem("input").with_property(MOUSE_PROPERTY, "1")
    }

    /// Require a property value
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// Which node represents a physical device when it has several
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalPolicy {
    /// `sys_name` prefix of the preferred node
    pub canonical_prefix: String,
}

impl Default for CanonicalPolicy {
    fn default() -> Self {
        Self::new("event")
    }
}

impl CanonicalPolicy {
    pub fn new(prefix: &str) -> Self {
        Self {
            canonical_prefix: prefix.to_string(),
        }
    }

    /// Whether a node with this `sys_name` is the canonical one
    pub fn is_canonical(&self, sys_name: &str) -> bool {
        sys_name.starts_with(&self.canonical_prefix)
    }
}

/// Counters for one enumeration pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnumerationStats {
    /// Nodes returned by the scan
    pub listed: usize,
    /// Nodes that disappeared between listing and opening
    pub vanished: usize,
    /// Nodes with neither a parent nor a registry path of their own
    pub unkeyed: usize,
    /// Nodes skipped because their physical device was already covered
    pub duplicates: usize,
    /// Descriptors yielded
    pub yielded: usize,
}

/// Scan the registry and return the de-duplicated descriptors lazily
///
/// The seen-set lives in the returned [`Enumeration`] and dies with it; a
/// new call performs a fresh scan.
pub fn enumerate<R: Registry>(
    registry: &R,
    filter: &EnumerateFilter,
    policy: &CanonicalPolicy,
) -> Result<Enumeration<R>> {
    let context = Context::open(registry)?;
    let syspaths = {
        let enumerate =
            unsafe { Handle::acquire(registry.enumerate_new(context.as_non_null()?)) };
        let raw = enumerate.as_non_null().map_err(|_| {
            WatchError::RegistryUnavailable(format!(
                "could not create a {} enumerator",
                registry.backend_name()
            ))
        })?;

        if let Some(subsystem) = &filter.subsystem {
            unsafe { registry.enumerate_add_match_subsystem(raw, subsystem) }.map_err(|e| {
                WatchError::InvalidFilter(format!("subsystem '{}': {}", subsystem, e))
            })?;
        }
        for (key, value) in &filter.properties {
            unsafe { registry.enumerate_add_match_property(raw, key, value) }.map_err(|e| {
                WatchError::InvalidFilter(format!("property {}={}: {}", key, value, e))
            })?;
        }

        unsafe { registry.enumerate_scan_devices(raw) }?;
        unsafe { registry.enumerate_syspaths(raw) }
    };

    debug!(
        "Scan of {} listed {} node(s)",
        registry.backend_name(),
        syspaths.len()
    );

    Ok(Enumeration {
        stats: EnumerationStats {
            listed: syspaths.len(),
            ..Default::default()
        },
        context,
        syspaths: syspaths.into_iter(),
        policy: policy.clone(),
        reported: HashSet::new(),
        fallbacks: Vec::new(),
        fallback_index: HashMap::new(),
        flushed: 0,
    })
}

/// Single-pass sequence of de-duplicated descriptors
pub struct Enumeration<R: Registry> {
    context: Context<R>,
    syspaths: std::vec::IntoIter<String>,
    policy: CanonicalPolicy,
    /// Physical keys already yielded
    reported: HashSet<String>,
    /// First non-canonical node per physical key, cleared if a canonical one shows up
    fallbacks: Vec<Option<Descriptor<R>>>,
    fallback_index: HashMap<String, usize>,
    flushed: usize,
    stats: EnumerationStats,
}

impl<R: Registry> Enumeration<R> {
    /// Counters so far
    pub fn stats(&self) -> EnumerationStats {
        self.stats
    }

    /// The context devices are opened from
    pub fn context(&self) -> &Context<R> {
        &self.context
    }

    fn next_listed(&mut self) -> Option<Descriptor<R>> {
        for syspath in self.syspaths.by_ref() {
            let Some(device) = self.context.device_from_syspath(&syspath) else {
                debug!("Skipping {}: removed since it was listed", syspath);
                self.stats.vanished += 1;
                continue;
            };

            let descriptor = Descriptor::enumerated(device);
            let Some(key) = descriptor.physical_key() else {
                debug!("Skipping {}: no registry path", syspath);
                self.stats.unkeyed += 1;
                continue;
            };

            if self.reported.contains(&key) {
                trace!("{} duplicates already reported {}", syspath, key);
                self.stats.duplicates += 1;
                continue;
            }

            let canonical = descriptor
                .sys_name()
                .map_or(false, |name| self.policy.is_canonical(&name));

            if canonical {
                if let Some(index) = self.fallback_index.remove(&key) {
                    trace!("{} replaces the fallback node for {}", syspath, key);
                    self.fallbacks[index] = None;
                    self.stats.duplicates += 1;
                }
                self.reported.insert(key);
                return Some(descriptor);
            }

            if self.fallback_index.contains_key(&key) {
                trace!("{} duplicates pending {}", syspath, key);
                self.stats.duplicates += 1;
                continue;
            }
            trace!("Holding {} as fallback for {}", syspath, key);
            self.fallback_index.insert(key, self.fallbacks.len());
            self.fallbacks.push(Some(descriptor));
        }
        None
    }

    fn next_fallback(&mut self) -> Option<Descriptor<R>> {
        while self.flushed < self.fallbacks.len() {
            let slot = self.fallbacks[self.flushed].take();
            self.flushed += 1;
            if slot.is_some() {
                return slot;
            }
        }
        None
    }
}

impl<R: Registry> Iterator for Enumeration<R> {
    type Item = Descriptor<R>;

    fn next(&mut self) -> Option<Descriptor<R>> {
        let next = self.next_listed().or_else(|| self.next_fallback());
        if next.is_some() {
            self.stats.yielded += 1;
        }
        next
    }
}

impl<R: Registry> std::fmt::Debug for Enumeration<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enumeration")
            .field("policy", &self.policy)
            .field("remaining", &self.syspaths.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::descriptor::DeviceAttributes;
    use crate::testdb::{MockRegistry, NodeSpec};

    fn parent(syspath: &str, name: &str) -> NodeSpec {
        let sys_name = syspath.rsplit('/').next().unwrap();
        NodeSpec::new(syspath, sys_name, "input").with_property("NAME", name)
    }

    fn mouse_node(parent: &str, sys_name: &str) -> NodeSpec {
        NodeSpec::new(&format!("{}/{}", parent, sys_name), sys_name, "input")
            .with_parent(parent)
            .with_property("ID_INPUT_MOUSE", "1")
    }

    fn sys_names<R: Registry>(enumeration: Enumeration<R>) -> Vec<String> {
        enumeration.filter_map(|d| d.sys_name()).collect()
    }

    #[test]
    fn test_one_descriptor_per_physical_mouse() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Logi Mouse"),
            mouse_node("/sys/devices/m1", "mouse0"),
            mouse_node("/sys/devices/m1", "event3"),
        ]);

        let descriptors: Vec<_> =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
                .unwrap()
                .collect();

        assert_eq!(descriptors.len(), 1);
        let only = &descriptors[0];
        assert_eq!(only.sys_name().as_deref(), Some("event3"));
        assert_eq!(
            only.parent().unwrap().property("NAME").as_deref(),
            Some("Logi Mouse")
        );
    }

    #[test]
    fn test_dedup_independent_of_listing_order() {
        let mut nodes = vec![
            parent("/sys/devices/m1", "Shared"),
            parent("/sys/devices/m2", "Second"),
            parent("/sys/devices/m3", "Third"),
        ];
        for name in ["mouse0", "event3", "mouse1", "js0"] {
            nodes.push(mouse_node("/sys/devices/m1", name));
        }
        nodes.push(mouse_node("/sys/devices/m2", "event5"));
        nodes.push(mouse_node("/sys/devices/m3", "mouse2"));

        for seed in 0..32 {
            let registry = MockRegistry::with_nodes(nodes.clone());
            registry.shuffle_listing(seed);

            let mut enumeration =
                enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
                    .unwrap();
            let mut keys: Vec<(String, String)> = enumeration
                .by_ref()
                .map(|d| (d.physical_key().unwrap(), d.sys_name().unwrap()))
                .collect();
            keys.sort();

            assert_eq!(
                keys,
                vec![
                    ("/devices/m1".to_string(), "event3".to_string()),
                    ("/devices/m2".to_string(), "event5".to_string()),
                    ("/devices/m3".to_string(), "mouse2".to_string()),
                ],
                "seed {}",
                seed
            );
            let stats = enumeration.stats();
            assert_eq!(stats.listed, 6);
            assert_eq!(stats.yielded, 3);
            assert_eq!(stats.duplicates, 3);
        }
    }

    #[test]
    fn test_fallback_follows_canonical_nodes() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Old Mouse"),
            parent("/sys/devices/m2", "New Mouse"),
            mouse_node("/sys/devices/m1", "mouse0"),
            mouse_node("/sys/devices/m2", "event7"),
        ]);

        let enumeration =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default()).unwrap();
        assert_eq!(sys_names(enumeration), vec!["event7", "mouse0"]);
    }

    #[test]
    fn test_custom_canonical_prefix() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Mouse"),
            mouse_node("/sys/devices/m1", "event3"),
            mouse_node("/sys/devices/m1", "mouse0"),
        ]);

        let enumeration =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::new("mouse"))
                .unwrap();
        assert_eq!(sys_names(enumeration), vec!["mouse0"]);
    }

    #[test]
    fn test_vanished_node_is_skipped() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Mouse"),
            parent("/sys/devices/m2", "Unplugged"),
            mouse_node("/sys/devices/m1", "event3"),
            mouse_node("/sys/devices/m2", "event4"),
        ]);

        let mut enumeration =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default()).unwrap();
        registry.remove_node("/sys/devices/m2/event4");

        let names: Vec<_> = enumeration.by_ref().filter_map(|d| d.sys_name()).collect();
        assert_eq!(names, vec!["event3"]);
        assert_eq!(enumeration.stats().vanished, 1);
        assert_eq!(enumeration.stats().unkeyed, 0);
    }

    #[test]
    fn test_parentless_node_stands_for_itself() {
        let registry = MockRegistry::with_nodes(vec![
            NodeSpec::new("/sys/devices/virtual/event9", "event9", "input")
                .with_property("ID_INPUT_MOUSE", "1"),
        ]);

        let descriptors: Vec<_> =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
                .unwrap()
                .collect();
        assert_eq!(descriptors.len(), 1);
        assert!(descriptors[0].parent().is_none());
        assert_eq!(
            descriptors[0].physical_key().as_deref(),
            Some("/devices/virtual/event9")
        );
    }

    #[test]
    fn test_filters_are_applied() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Mouse"),
            mouse_node("/sys/devices/m1", "event3"),
            NodeSpec::new("/sys/devices/k1/event0", "event0", "input")
                .with_property("ID_INPUT_KEYBOARD", "1"),
            NodeSpec::new("/sys/devices/pci0/usb1", "usb1", "usb")
                .with_property("ID_INPUT_MOUSE", "1"),
        ]);

        let mice =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default()).unwrap();
        assert_eq!(sys_names(mice), vec!["event3"]);

        let input = enumerate(
            &registry,
            &EnumerateFilter::subsystem("input"),
            &CanonicalPolicy::default(),
        )
        .unwrap();
        // The parentless m1 node shares its key with event3 and loses to it
        assert_eq!(sys_names(input), vec!["event3", "event0"]);
    }

    #[test]
    fn test_seen_set_is_per_call() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Mouse"),
            mouse_node("/sys/devices/m1", "event3"),
        ]);
        let filter = EnumerateFilter::mice();
        let policy = CanonicalPolicy::default();

        assert_eq!(enumerate(&registry, &filter, &policy).unwrap().count(), 1);
        assert_eq!(enumerate(&registry, &filter, &policy).unwrap().count(), 1);
    }

    #[test]
    fn test_registry_unavailable() {
        let registry = MockRegistry::new();
        registry.fail_context_creation(true);

        let err = enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
            .unwrap_err();
        assert!(matches!(err, WatchError::RegistryUnavailable(_)));
    }

    #[test]
    fn test_every_reference_released() {
        let registry = MockRegistry::with_nodes(vec![
            parent("/sys/devices/m1", "Mouse"),
            parent("/sys/devices/m2", "Other"),
            mouse_node("/sys/devices/m1", "mouse0"),
            mouse_node("/sys/devices/m1", "event3"),
            mouse_node("/sys/devices/m2", "mouse1"),
        ]);

        {
            let mut enumeration =
                enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
                    .unwrap();
            // Stop half way; pending fallbacks must still be released
            let first = enumeration.next().unwrap();
            assert_eq!(first.sys_name().as_deref(), Some("event3"));
        }
        assert!(registry.ledger().is_balanced());

        let all: Vec<_> =
            enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())
                .unwrap()
                .collect();
        assert_eq!(all.len(), 2);
        drop(all);
        assert!(registry.ledger().is_balanced());
    }
}
