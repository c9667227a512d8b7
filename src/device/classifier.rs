//! Mouse classification
//!
//! Turns descriptors into what a user cares about: which physical mouse it is,
//! whether it is a touchpad, and (for monitor events) what happened to it.

use super::descriptor::{Action, Descriptor, DeviceAttributes};
use super::enumerator::{CanonicalPolicy, Enumeration};
use super::registry::Registry;
use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Set to `1` by udev on mouse-class input nodes
pub const ID_INPUT_MOUSE: &str = "ID_INPUT_MOUSE";
/// Set by udev on touchpads
pub const ID_INPUT_TOUCHPAD: &str = "ID_INPUT_TOUCHPAD";
/// Product name on the physical input device
pub const NAME: &str = "NAME";

/// Touchpad check on the raw property value
///
/// Only the first character counts: `"1"` and `"1x"` are touchpads, while
/// `""`, `"0"` and an absent property are not.
pub fn is_touchpad_value(value: Option<&str>) -> bool {
    value.map_or(false, |value| value.as_bytes().first() == Some(&b'1'))
}

/// Strip the double quotes the kernel puts around input device names
pub fn display_name(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(raw)
}

/// A physical mouse
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MouseDevice {
    /// Parent `NAME` exactly as the registry reports it
    pub identity: String,
    /// `identity` without surrounding quotes
    pub product_name: String,
    pub is_touchpad: bool,
    /// Syspath of the physical device
    pub syspath: Option<String>,
}

/// What happened to a mouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Added,
    Removed,
    Changed,
}

impl MouseAction {
    /// Map a monitor action; anything but add/remove is a change
    pub fn from_action(action: Action) -> Self {
        match action {
            Action::Added => MouseAction::Added,
            Action::Removed => MouseAction::Removed,
            Action::Changed | Action::Unknown => MouseAction::Changed,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            MouseAction::Added => "added",
            MouseAction::Removed => "removed",
            MouseAction::Changed => "changed",
        }
    }
}

impl fmt::Display for MouseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A mouse hotplug event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MouseEvent {
    #[serde(flatten)]
    pub device: MouseDevice,
    pub action: MouseAction,
}

/// Decides which descriptors describe a reportable mouse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MouseClassifier {
    policy: CanonicalPolicy,
}

impl MouseClassifier {
    pub fn new(policy: CanonicalPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CanonicalPolicy {
        &self.policy
    }

    /// Describe the mouse behind a descriptor
    ///
    /// `None` unless the node is mouse-class and has a parent with a
    /// non-empty `NAME`.
    /// The canonical-node check is left to the caller: enumeration has
    /// already picked one node per physical device.
    pub fn describe<R: Registry>(&self, descriptor: &Descriptor<R>) -> Option<MouseDevice> {
        if descriptor.property(ID_INPUT_MOUSE).as_deref() != Some("1") {
            trace!("{:?} is not a mouse", descriptor.node_path());
            return None;
        }
        let Some(parent) = descriptor.parent() else {
            trace!("{:?} has no parent", descriptor.node_path());
            return None;
        };
        let Some(identity) = parent.property(NAME).filter(|name| !name.is_empty()) else {
            trace!("Parent of {:?} has no name", descriptor.node_path());
            return None;
        };

        Some(MouseDevice {
            product_name: display_name(&identity).to_string(),
            identity,
            is_touchpad: is_touchpad_value(descriptor.property(ID_INPUT_TOUCHPAD).as_deref()),
            syspath: parent.syspath(),
        })
    }

    /// Classify a monitor event
    ///
    /// Enumerated descriptors (no action) and non-canonical nodes are dropped.
    pub fn classify<R: Registry>(&self, descriptor: &Descriptor<R>) -> Option<MouseEvent> {
        let action = descriptor.action()?;
        let sys_name = descriptor.sys_name()?;
        if !self.policy.is_canonical(&sys_name) {
            trace!("{} is not the canonical node", sys_name);
            return None;
        }

        self.describe(descriptor).map(|device| MouseEvent {
            device,
            action: MouseAction::from_action(action),
        })
    }

    /// Mice found by an enumeration, one per physical device
    pub fn devices<R: Registry>(
        &self,
        enumeration: Enumeration<R>,
    ) -> impl Iterator<Item = MouseDevice> {
        let classifier = self.clone();
        enumeration.filter_map(move |descriptor| classifier.describe(&descriptor))
    }
}

/// Classify a monitor event with the given canonical policy
pub fn classify<R: Registry>(
    descriptor: &Descriptor<R>,
    policy: &CanonicalPolicy,
) -> Option<MouseEvent> {
    MouseClassifier::new(policy.clone()).classify(descriptor)
}
