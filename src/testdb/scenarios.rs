//! Predefined device-tree scenarios
//!
//! A [`Scenario`] is a simulated device tree, a scripted sequence of hotplug
//! events, and what a correct implementation reports for both. Scenarios
//! drive the unit tests, back the CLI's `--scenario` option, and can be
//! loaded from TOML fixture files to replay a recorded session.

use super::mock_registry::{LedgerSnapshot, MockRegistry, NodeSpec};
use crate::core::config::ConfigError;
use crate::core::error::Result;
use crate::device::classifier::{MouseAction, MouseClassifier, MouseDevice, MouseEvent};
use crate::device::enumerator::{enumerate, CanonicalPolicy, EnumerateFilter};
use crate::device::monitor::{Drained, EventSource, MonitorSource, MouseMonitor};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Scripted action that wakes monitors without delivering a device
pub const WAKEUP_ACTION: &str = "wakeup";

/// One scripted registry event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedEvent {
    /// Registry action (`add`, `remove`, `change`, ...) or [`WAKEUP_ACTION`]
    pub action: String,
    /// Node the event is about
    #[serde(default)]
    pub syspath: String,
    /// Pause before the event when replaying in real time
    #[serde(default)]
    pub delay_ms: u64,
    /// Nodes plugged in before the event is emitted
    #[serde(default)]
    pub attach: Vec<NodeSpec>,
    /// Nodes unplugged before the event is emitted. The event's own node is
    /// removed after emitting, so the event can still be delivered.
    #[serde(default)]
    pub detach: Vec<String>,
}

impl ScriptedEvent {
    pub fn new(action: &str, syspath: &str) -> Self {
        Self {
            action: action.to_string(),
            syspath: syspath.to_string(),
            delay_ms: 0,
            attach: Vec::new(),
            detach: Vec::new(),
        }
    }

    /// A wakeup with nothing to receive
    pub fn wakeup() -> Self {
        Self::new(WAKEUP_ACTION, "")
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn attaching(mut self, nodes: Vec<NodeSpec>) -> Self {
        self.attach = nodes;
        self
    }

    pub fn detaching(mut self, syspaths: &[&str]) -> Self {
        self.detach = syspaths.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Apply the event to `registry`; returns the number of monitors reached
    pub fn apply(&self, registry: &MockRegistry) -> usize {
        for node in &self.attach {
            registry.add_node(node.clone());
        }
        for syspath in self.detach.iter().filter(|s| **s != self.syspath) {
            registry.remove_node(syspath);
        }

        let delivered = if self.action == WAKEUP_ACTION {
            registry.emit_spurious()
        } else {
            registry.emit(&self.action, &self.syspath)
        };

        if self.detach.contains(&self.syspath) {
            registry.remove_node(&self.syspath);
        }
        delivered
    }
}

/// A mouse a scenario expects to be reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedMouse {
    pub identity: String,
    #[serde(default)]
    pub is_touchpad: bool,
}

/// A hotplug event a scenario expects to be reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEvent {
    pub action: MouseAction,
    pub identity: String,
}

/// Expected results of listing and replaying a scenario
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectedResults {
    /// Mice reported by a listing, in order
    pub mice: Vec<ExpectedMouse>,
    /// Mouse events reported while replaying the script, in order
    pub events: Vec<ExpectedEvent>,
}

/// A complete scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name for identification
    pub name: String,
    /// Description of what this scenario exercises
    #[serde(default)]
    pub description: String,
    /// Device tree present before the script starts
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Scripted hotplug events
    #[serde(default)]
    pub events: Vec<ScriptedEvent>,
    /// What should be reported
    #[serde(default)]
    pub expected: ExpectedResults,
    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of [`Scenario::run`]
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub mice: Vec<MouseDevice>,
    pub events: Vec<MouseEvent>,
    /// Readiness notifications that yielded nothing
    pub wakeups: usize,
    #[serde(skip)]
    pub ledger: LedgerSnapshot,
    /// Mismatches; empty when the scenario passed
    pub failures: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Scenario {
    /// Create a new scenario
    pub fn new(name: &str, description: &str, nodes: Vec<NodeSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            nodes,
            events: Vec::new(),
            expected: ExpectedResults::default(),
            tags: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<ScriptedEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_expected(mut self, expected: ExpectedResults) -> Self {
        self.expected = expected;
        self
    }

    /// Add tags to the scenario
    pub fn with_tags(mut self, tags: Vec<&str>) -> Self {
        self.tags = tags.into_iter().map(String::from).collect();
        self
    }

    /// Parse a scenario from TOML
    pub fn from_toml(content: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::ParseError(Default::default(), e.to_string()))
    }

    /// Load a scenario fixture file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Serialize the scenario as a TOML fixture
    pub fn to_toml(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// A registry holding the scenario's initial device tree
    pub fn install(&self) -> MockRegistry {
        MockRegistry::with_nodes(self.nodes.clone())
    }

    /// List mice, replay the script through a mouse monitor and compare
    /// everything with the expected results
    pub fn run(&self) -> Result<ScenarioReport> {
        let registry = self.install();
        let classifier = MouseClassifier::default();

        let listing = enumerate(
            &registry,
            &EnumerateFilter::mice(),
            &CanonicalPolicy::default(),
        )?;
        let mice: Vec<MouseDevice> = classifier.devices(listing).collect();

        let mut monitor = MouseMonitor::open(&registry, MonitorSource::Udev, classifier)?;
        let mut events = Vec::new();
        let mut wakeups = 0;
        for scripted in &self.events {
            let delivered = scripted.apply(&registry);
            debug!(
                "[{}] {} {} reached {} monitor(s)",
                self.name, scripted.action, scripted.syspath, delivered
            );
            loop {
                match monitor.drain()? {
                    Drained::Nothing => {
                        wakeups += 1;
                        break;
                    }
                    Drained::Dropped => {}
                    Drained::Item(event) => events.push(event),
                }
            }
        }
        monitor.stop();
        drop(monitor);

        let ledger = registry.ledger();
        let failures = self.compare(&mice, &events, &ledger);
        Ok(ScenarioReport {
            name: self.name.clone(),
            mice,
            events,
            wakeups,
            ledger,
            failures,
        })
    }

    fn compare(
        &self,
        mice: &[MouseDevice],
        events: &[MouseEvent],
        ledger: &LedgerSnapshot,
    ) -> Vec<String> {
        let mut failures = Vec::new();

        let listed: Vec<ExpectedMouse> = mice
            .iter()
            .map(|m| ExpectedMouse {
                identity: m.identity.clone(),
                is_touchpad: m.is_touchpad,
            })
            .collect();
        if listed != self.expected.mice {
            failures.push(format!(
                "listing: expected {:?}, got {:?}",
                self.expected.mice, listed
            ));
        }

        let reported: Vec<ExpectedEvent> = events
            .iter()
            .map(|e| ExpectedEvent {
                action: e.action,
                identity: e.device.identity.clone(),
            })
            .collect();
        if reported != self.expected.events {
            failures.push(format!(
                "events: expected {:?}, got {:?}",
                self.expected.events, reported
            ));
        }

        if !ledger.is_balanced() {
            failures.push(format!("references not balanced: {:?}", ledger));
        }
        failures
    }
}

fn physical(syspath: &str, name: &str) -> NodeSpec {
    let sys_name = syspath.rsplit('/').next().unwrap_or(syspath);
    NodeSpec::new(syspath, sys_name, "input").with_property("NAME", name)
}

fn mouse_node(parent: &str, sys_name: &str) -> NodeSpec {
    NodeSpec::new(&format!("{}/{}", parent, sys_name), sys_name, "input")
        .with_parent(parent)
        .with_property("ID_INPUT", "1")
        .with_property("ID_INPUT_MOUSE", "1")
}

fn keyboard_node(parent: &str, sys_name: &str) -> NodeSpec {
    NodeSpec::new(&format!("{}/{}", parent, sys_name), sys_name, "input")
        .with_parent(parent)
        .with_property("ID_INPUT", "1")
        .with_property("ID_INPUT_KEYBOARD", "1")
}

fn mouse(identity: &str, is_touchpad: bool) -> ExpectedMouse {
    ExpectedMouse {
        identity: identity.to_string(),
        is_touchpad,
    }
}

fn event(action: MouseAction, identity: &str) -> ExpectedEvent {
    ExpectedEvent {
        action,
        identity: identity.to_string(),
    }
}

const USB_MOUSE: &str = "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/input/input7";
const TOUCHPAD: &str = "/sys/devices/platform/i8042/serio1/input/input5";
const TRACKPOINT: &str = "/sys/devices/platform/i8042/serio1/serio2/input/input6";
const KEYBOARD: &str = "/sys/devices/platform/i8042/serio0/input/input3";

/// Collection of all predefined scenarios
pub struct ScenarioLibrary;

impl ScenarioLibrary {
    // =========================================================================
    // LISTING SCENARIOS
    // =========================================================================

    /// One USB mouse exposing both a `mouse` and an `event` node
    pub fn single_mouse() -> Scenario {
        Scenario::new(
            "single_mouse",
            "One physical mouse with mouse0 and event7 nodes is listed once",
            vec![
                physical(USB_MOUSE, "Logitech USB Optical Mouse"),
                mouse_node(USB_MOUSE, "mouse0"),
                mouse_node(USB_MOUSE, "event7"),
            ],
        )
        .with_expected(ExpectedResults {
            mice: vec![mouse("Logitech USB Optical Mouse", false)],
            events: vec![],
        })
        .with_tags(vec!["listing", "basic"])
    }

    /// Laptop with a touchpad, a trackpoint and a keyboard
    pub fn touchpad_laptop() -> Scenario {
        Scenario::new(
            "touchpad_laptop",
            "Touchpad and trackpoint are separate mice; the keyboard is ignored",
            vec![
                physical(KEYBOARD, "\"AT Translated Set 2 keyboard\""),
                keyboard_node(KEYBOARD, "event2"),
                physical(TOUCHPAD, "\"SynPS/2 Synaptics TouchPad\""),
                mouse_node(TOUCHPAD, "mouse1"),
                mouse_node(TOUCHPAD, "event5").with_property("ID_INPUT_TOUCHPAD", "1"),
                physical(TRACKPOINT, "\"TPPS/2 IBM TrackPoint\""),
                mouse_node(TRACKPOINT, "event6").with_property("ID_INPUT_TOUCHPAD", "0"),
                mouse_node(TRACKPOINT, "mouse2"),
            ],
        )
        .with_expected(ExpectedResults {
            mice: vec![
                mouse("\"SynPS/2 Synaptics TouchPad\"", true),
                mouse("\"TPPS/2 IBM TrackPoint\"", false),
            ],
            events: vec![],
        })
        .with_tags(vec!["listing", "touchpad"])
    }

    /// A mouse whose only node is the legacy `mouse` node
    pub fn mouse_without_event_node() -> Scenario {
        Scenario::new(
            "mouse_without_event_node",
            "Without a canonical node the first node seen represents the mouse, after canonical ones",
            vec![
                physical("/sys/devices/platform/legacy/input/input9", "Legacy Mouse"),
                mouse_node("/sys/devices/platform/legacy/input/input9", "mouse3"),
                mouse_node("/sys/devices/platform/legacy/input/input9", "js0"),
                physical(USB_MOUSE, "Logitech USB Optical Mouse"),
                mouse_node(USB_MOUSE, "event7"),
            ],
        )
        .with_expected(ExpectedResults {
            mice: vec![
                mouse("Logitech USB Optical Mouse", false),
                mouse("Legacy Mouse", false),
            ],
            events: vec![],
        })
        .with_tags(vec!["listing", "fallback"])
    }

    // =========================================================================
    // MONITORING SCENARIOS
    // =========================================================================

    /// Plug a mouse in, change it, and unplug it
    pub fn hotplug_session() -> Scenario {
        Scenario::new(
            "hotplug_session",
            "Add, change and remove of a USB mouse, one report per canonical event",
            vec![
                physical(KEYBOARD, "\"AT Translated Set 2 keyboard\""),
                keyboard_node(KEYBOARD, "event2"),
            ],
        )
        .with_events(vec![
            ScriptedEvent::new("add", USB_MOUSE).attaching(vec![
                physical(USB_MOUSE, "Logitech USB Optical Mouse"),
                mouse_node(USB_MOUSE, "mouse0"),
                mouse_node(USB_MOUSE, "event7"),
            ]),
            ScriptedEvent::new("add", &format!("{}/mouse0", USB_MOUSE)).with_delay(20),
            ScriptedEvent::new("add", &format!("{}/event7", USB_MOUSE)).with_delay(20),
            ScriptedEvent::new("change", &format!("{}/event7", USB_MOUSE)).with_delay(500),
            ScriptedEvent::new("remove", &format!("{}/mouse0", USB_MOUSE))
                .with_delay(1000)
                .detaching(&[&format!("{}/mouse0", USB_MOUSE)]),
            ScriptedEvent::new("remove", &format!("{}/event7", USB_MOUSE))
                .with_delay(20)
                .detaching(&[&format!("{}/event7", USB_MOUSE)]),
            ScriptedEvent::new("remove", USB_MOUSE)
                .with_delay(20)
                .detaching(&[USB_MOUSE]),
        ])
        .with_expected(ExpectedResults {
            mice: vec![],
            events: vec![
                event(MouseAction::Added, "Logitech USB Optical Mouse"),
                event(MouseAction::Changed, "Logitech USB Optical Mouse"),
                event(MouseAction::Removed, "Logitech USB Optical Mouse"),
            ],
        })
        .with_tags(vec!["monitor", "hotplug", "basic"])
    }

    /// Readiness notifications that carry nothing
    pub fn spurious_wakeups() -> Scenario {
        Scenario::new(
            "spurious_wakeups",
            "Wakeups without a device are ignored and do not disturb ordering",
            vec![
                physical(TOUCHPAD, "\"SynPS/2 Synaptics TouchPad\""),
                mouse_node(TOUCHPAD, "event5").with_property("ID_INPUT_TOUCHPAD", "1"),
            ],
        )
        .with_events(vec![
            ScriptedEvent::wakeup(),
            ScriptedEvent::new("change", &format!("{}/event5", TOUCHPAD)).with_delay(100),
            ScriptedEvent::wakeup().with_delay(100),
            ScriptedEvent::wakeup(),
            ScriptedEvent::new("change", &format!("{}/event5", TOUCHPAD)).with_delay(100),
        ])
        .with_expected(ExpectedResults {
            mice: vec![mouse("\"SynPS/2 Synaptics TouchPad\"", true)],
            events: vec![
                event(MouseAction::Changed, "\"SynPS/2 Synaptics TouchPad\""),
                event(MouseAction::Changed, "\"SynPS/2 Synaptics TouchPad\""),
            ],
        })
        .with_tags(vec!["monitor", "edge-case"])
    }

    /// The physical device is gone before its node's remove event arrives
    pub fn unplug_race() -> Scenario {
        Scenario::new(
            "unplug_race",
            "A remove whose parent can no longer be resolved is dropped",
            vec![
                physical(USB_MOUSE, "Logitech USB Optical Mouse"),
                mouse_node(USB_MOUSE, "event7"),
            ],
        )
        .with_events(vec![ScriptedEvent::new(
            "remove",
            &format!("{}/event7", USB_MOUSE),
        )
        .detaching(&[USB_MOUSE, &format!("{}/event7", USB_MOUSE)])])
        .with_expected(ExpectedResults {
            mice: vec![mouse("Logitech USB Optical Mouse", false)],
            events: vec![],
        })
        .with_tags(vec!["monitor", "edge-case"])
    }

    /// Get all available scenarios
    pub fn all_scenarios() -> Vec<Scenario> {
        vec![
            Self::single_mouse(),
            Self::touchpad_laptop(),
            Self::mouse_without_event_node(),
            Self::hotplug_session(),
            Self::spurious_wakeups(),
            Self::unplug_race(),
        ]
    }

    /// Get scenarios by tag
    pub fn scenarios_by_tag(tag: &str) -> Vec<Scenario> {
        Self::all_scenarios()
            .into_iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Look a scenario up by name
    pub fn by_name(name: &str) -> Option<Scenario> {
        Self::all_scenarios().into_iter().find(|s| s.name == name)
    }
}
