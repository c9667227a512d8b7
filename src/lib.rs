//! mouse-watch Library
//!
//! Lists the mice connected to a Linux machine and watches them being plugged
//! in and out, through the udev device registry. A physical mouse usually
//! exposes several device nodes (`mouse0`, `event7`, ...); every listing and
//! every event is reported once per physical device.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`core`] - Configuration and error handling
//! - [`device`] - Registry access: reference-counted handles, device
//!   descriptors, deduplicating enumeration, live monitoring and mouse
//!   classification
//! - [`testdb`] - In-memory registry and scenarios for testing without
//!   hardware
//! - [`cli`] - Command-line interface (only used by the binary)
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use mouse_watch::device::{enumerate, CanonicalPolicy, EnumerateFilter, MouseClassifier};
//! use mouse_watch::testdb::ScenarioLibrary;
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = ScenarioLibrary::touchpad_laptop().install();
//!     let classifier = MouseClassifier::default();
//!
//!     let listing = enumerate(&registry, &EnumerateFilter::mice(), &CanonicalPolicy::default())?;
//!     for mouse in classifier.devices(listing) {
//!         println!("{} (touchpad: {})", mouse.product_name, mouse.is_touchpad);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform Support
//!
//! The system registry backend ([`device::Libudev`]) is built on Linux with
//! the `libudev` feature. Everything else, including the in-memory registry,
//! builds on any Unix.

// Core modules - always available
pub mod cli;
pub mod core;
pub mod device;
pub mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
