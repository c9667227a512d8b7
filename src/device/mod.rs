//! Device discovery and hotplug monitoring
//!
//! This module wraps a udev-like device registry and reports physical mice.
//!
//! # Submodules
//!
//! - `handle` - Reference-counted handles to registry objects
//! - `registry` - The raw registry interface and the owned context
//! - `descriptor` - Device objects and the descriptors built from them
//! - `enumerator` - One-shot scan, one descriptor per physical device
//! - `monitor` - Live event feed with an explicit readiness/drain contract
//! - `classifier` - Mouse and touchpad classification
//! - `libudev` - System libudev backend (feature `libudev`, Linux only)
//!
//! # Architecture
//!
//! Everything above `registry` is generic over the [`Registry`] trait. The
//! libudev backend and the in-memory registry in `testdb` both implement it,
//! so enumeration and monitoring can be tested without hardware.

pub mod classifier;
pub mod descriptor;
pub mod enumerator;
pub mod handle;
#[cfg(all(feature = "libudev", target_os = "linux"))]
pub mod libudev;
pub mod monitor;
pub mod registry;

pub use classifier::{MouseAction, MouseClassifier, MouseDevice, MouseEvent};
pub use descriptor::{Action, Descriptor, Device, DeviceAttributes, ParentRef};
pub use enumerator::{enumerate, CanonicalPolicy, EnumerateFilter, Enumeration, EnumerationStats};
pub use handle::{Borrowed, Handle, RefCounted};
#[cfg(all(feature = "libudev", target_os = "linux"))]
pub use libudev::Libudev;
pub use monitor::{Drained, EventSource, Monitor, MonitorSource, MonitorState, MouseMonitor};
pub use registry::{Context, Registry};
