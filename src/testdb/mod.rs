//! Test Database Module
//!
//! An in-memory device registry and a library of device-tree scenarios, so
//! enumeration and monitoring can be exercised without real hardware or
//! libudev.
//!
//! # Features
//!
//! - **Mock Registry**: simulated device tree with per-object reference
//!   counts and a ledger that records every acquire, retain and release
//! - **Hotplug Events**: scripted add/remove/change events delivered over a
//!   real datagram socket, so readiness loops work unchanged
//! - **Scenarios**: predefined device trees and scripts with expected
//!   results, also loadable from TOML fixture files
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mouse_watch::testdb::ScenarioLibrary;
//!
//! for scenario in ScenarioLibrary::all_scenarios() {
//!     let report = scenario.run().unwrap();
//!     println!("{}: {}", report.name, if report.passed() { "ok" } else { "FAILED" });
//! }
//! ```
//!
//! # Available Scenarios
//!
//! ## Listing
//! - `single_mouse` - One mouse with two nodes is listed once
//! - `touchpad_laptop` - Touchpad, trackpoint and keyboard
//! - `mouse_without_event_node` - Fallback to the first node seen
//!
//! ## Monitoring
//! - `hotplug_session` - Add, change and remove of a USB mouse
//! - `spurious_wakeups` - Readiness without a device
//! - `unplug_race` - Remove event after the parent is gone

pub mod mock_registry;
pub mod scenarios;

pub use mock_registry::{
    LedgerSnapshot, MockContext, MockDevice, MockEnumerate, MockMonitor, MockRegistry, NodeSpec,
};
pub use scenarios::{
    ExpectedEvent, ExpectedMouse, ExpectedResults, Scenario, ScenarioLibrary, ScenarioReport,
    ScriptedEvent, WAKEUP_ACTION,
};
