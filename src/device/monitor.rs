//! Live device event monitor
//!
//! [`Monitor`] follows the registry's event feed:
//!
//! ```text
//! Created --start--> Receiving --stop--> Closed
//!                        |
//!                        +--receive error--> Failed
//! ```
//!
//! Filters are installed while `Created`. Once receiving, the caller waits on
//! [`Monitor::readiness_descriptor`] with whatever reactor it uses and calls
//! [`Monitor::receive`] (or [`MouseMonitor::drain_one`]) once per readiness
//! notification. Nothing is buffered or reordered here.

use super::classifier::{MouseClassifier, MouseEvent};
use super::descriptor::{Descriptor, Device};
use super::handle::Handle;
use super::registry::{Context, Registry};
use crate::core::error::{Result, WatchError};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::io::RawFd;

/// Event feed a monitor listens to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MonitorSource {
    /// Events after udev rule processing, with udev properties
    #[default]
    Udev,
    /// Raw kernel uevents
    Kernel,
}

impl MonitorSource {
    /// Name the registry expects
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorSource::Udev => "udev",
            MonitorSource::Kernel => "kernel",
        }
    }
}

impl fmt::Display for MonitorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a [`Monitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Allocated, accepting filters
    Created,
    /// Started; events can be received
    Receiving,
    /// Stopped by the caller
    Closed,
    /// A receive failed; the monitor is unusable
    Failed,
}

/// Counters of a monitor's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Filters installed
    pub filters: usize,
    /// Events received
    pub received: usize,
    /// Receives that found nothing
    pub spurious: usize,
}

/// Outcome of draining one readiness notification
#[derive(Debug)]
pub enum Drained<T> {
    /// The registry had nothing to deliver
    Nothing,
    /// An event arrived but was filtered out
    Dropped,
    /// An event to report
    Item(T),
}

impl<T> Drained<T> {
    /// The reported item, if any
    pub fn into_item(self) -> Option<T> {
        match self {
            Drained::Item(item) => Some(item),
            Drained::Nothing | Drained::Dropped => None,
        }
    }

    /// Whether the registry's queue was empty
    pub fn is_nothing(&self) -> bool {
        matches!(self, Drained::Nothing)
    }
}

/// Something a readiness loop can wait on and drain
pub trait EventSource {
    /// What one drained event turns into
    type Event;

    /// Descriptor to register with the reactor
    fn readiness_descriptor(&self) -> Result<RawFd>;

    /// Receive at most one event
    fn drain(&mut self) -> Result<Drained<Self::Event>>;
}

/// Subscription to the registry's live event feed
pub struct Monitor<R: Registry> {
    // Released before the context.
    handle: Handle<R::Monitor>,
    context: Context<R>,
    source: MonitorSource,
    state: MonitorState,
    stats: MonitorStats,
}

impl<R: Registry> Monitor<R> {
    /// Open a context and create a monitor on `source`
    pub fn new(registry: &R, source: MonitorSource) -> Result<Self> {
        let context = Context::open(registry)?;
        Self::with_context(context, source)
    }

    /// Create a monitor on an existing context
    pub fn with_context(context: Context<R>, source: MonitorSource) -> Result<Self> {
        let registry = context.registry();
        let handle =
            unsafe { Handle::acquire(registry.monitor_new(context.as_non_null()?, source.as_str())) };
        if handle.is_empty() {
            return Err(WatchError::RegistryUnavailable(format!(
                "could not create a {} monitor on '{}'",
                registry.backend_name(),
                source
            )));
        }

        debug!("Created {} monitor on '{}'", registry.backend_name(), source);
        Ok(Self {
            handle,
            context,
            source,
            state: MonitorState::Created,
            stats: MonitorStats::default(),
        })
    }

    /// Only deliver events for `subsystem` (and `devtype`, if given)
    ///
    /// Filters accumulate: an event passes if any filter accepts it.
    pub fn add_filter(&mut self, subsystem: &str, devtype: Option<&str>) -> Result<()> {
        match self.state {
            MonitorState::Created => {}
            MonitorState::Receiving => return Err(WatchError::FilterAfterStart),
            MonitorState::Closed | MonitorState::Failed => return Err(WatchError::MonitorClosed),
        }

        let raw = self.handle.as_non_null()?;
        unsafe {
            self.context
                .registry()
                .monitor_add_match(raw, subsystem, devtype)
        }
        .map_err(|e| {
            WatchError::InvalidFilter(format!(
                "{}{}: {}",
                subsystem,
                devtype.map(|d| format!("/{}", d)).unwrap_or_default(),
                e
            ))
        })?;

        trace!("Monitor filter {} {:?}", subsystem, devtype);
        self.stats.filters += 1;
        Ok(())
    }

    /// Start receiving events
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            MonitorState::Created => {}
            MonitorState::Receiving => return Err(WatchError::AlreadyStarted),
            MonitorState::Closed | MonitorState::Failed => return Err(WatchError::MonitorClosed),
        }

        let raw = self.handle.as_non_null()?;
        if let Err(e) = unsafe { self.context.registry().monitor_enable(raw) } {
            self.fail();
            return Err(WatchError::MonitorFailure(e));
        }

        info!(
            "Monitoring '{}' events with {} filter(s)",
            self.source, self.stats.filters
        );
        self.state = MonitorState::Receiving;
        Ok(())
    }

    /// Descriptor that becomes readable when an event is waiting
    pub fn readiness_descriptor(&self) -> Result<RawFd> {
        self.ensure_receiving()?;
        let raw = self.handle.as_non_null()?;
        Ok(unsafe { self.context.registry().monitor_fd(raw) })
    }

    /// Receive the next event, if one is available
    ///
    /// `Ok(None)` is a spurious wakeup. An error leaves the monitor `Failed`
    /// with its handles released.
    pub fn receive(&mut self) -> Result<Option<Descriptor<R>>> {
        self.ensure_receiving()?;
        let raw = self.handle.as_non_null()?;

        let received = match unsafe { self.context.registry().monitor_receive(raw) } {
            Ok(received) => received,
            Err(e) => {
                warn!("Receiving from the '{}' monitor failed: {}", self.source, e);
                self.fail();
                return Err(WatchError::MonitorFailure(e));
            }
        };

        match unsafe { Device::from_owned_raw(&self.context, received) } {
            Some(device) => {
                self.stats.received += 1;
                let descriptor = Descriptor::monitored(device);
                trace!("Received {:?}", descriptor);
                Ok(Some(descriptor))
            }
            None => {
                self.stats.spurious += 1;
                debug!("Spurious wakeup on the '{}' monitor", self.source);
                Ok(None)
            }
        }
    }

    /// Release the monitor and its context; no further events are produced
    pub fn stop(&mut self) {
        if self.state == MonitorState::Closed {
            return;
        }
        self.release();
        if self.state != MonitorState::Failed {
            self.state = MonitorState::Closed;
        }
        debug!(
            "Monitor on '{}' closed after {} event(s)",
            self.source, self.stats.received
        );
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn source(&self) -> MonitorSource {
        self.source
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    fn ensure_receiving(&self) -> Result<()> {
        match self.state {
            MonitorState::Receiving => Ok(()),
            MonitorState::Created => Err(WatchError::NotStarted),
            MonitorState::Closed | MonitorState::Failed => Err(WatchError::MonitorClosed),
        }
    }

    fn fail(&mut self) {
        self.release();
        self.state = MonitorState::Failed;
    }

    // Monitor first, then the context it was created on.
    fn release(&mut self) {
        self.handle.reset();
        self.context.reset();
    }
}

impl<R: Registry> EventSource for Monitor<R> {
    type Event = Descriptor<R>;

    fn readiness_descriptor(&self) -> Result<RawFd> {
        Monitor::readiness_descriptor(self)
    }

    fn drain(&mut self) -> Result<Drained<Descriptor<R>>> {
        Ok(match self.receive()? {
            Some(descriptor) => Drained::Item(descriptor),
            None => Drained::Nothing,
        })
    }
}

impl<R: Registry> fmt::Debug for Monitor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("source", &self.source)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Monitor that reports mouse hotplug events
pub struct MouseMonitor<R: Registry> {
    monitor: Monitor<R>,
    classifier: MouseClassifier,
}

impl<R: Registry> MouseMonitor<R> {
    /// Wrap a monitor; filters and start are up to the caller
    pub fn new(monitor: Monitor<R>, classifier: MouseClassifier) -> Self {
        Self {
            monitor,
            classifier,
        }
    }

    /// Started monitor on the `input` subsystem
    pub fn open(registry: &R, source: MonitorSource, classifier: MouseClassifier) -> Result<Self> {
        let mut monitor = Monitor::new(registry, source)?;
        monitor.add_filter("input", None)?;
        monitor.start()?;
        Ok(Self::new(monitor, classifier))
    }

    pub fn readiness_descriptor(&self) -> Result<RawFd> {
        self.monitor.readiness_descriptor()
    }

    /// Receive one event and classify it
    ///
    /// `Ok(None)` covers both a spurious wakeup and an event that is not
    /// about a reportable mouse.
    pub fn drain_one(&mut self) -> Result<Option<MouseEvent>> {
        Ok(self.drain()?.into_item())
    }

    pub fn monitor(&self) -> &Monitor<R> {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut Monitor<R> {
        &mut self.monitor
    }

    pub fn stop(&mut self) {
        self.monitor.stop();
    }
}

impl<R: Registry> EventSource for MouseMonitor<R> {
    type Event = MouseEvent;

    fn readiness_descriptor(&self) -> Result<RawFd> {
        self.monitor.readiness_descriptor()
    }

    fn drain(&mut self) -> Result<Drained<MouseEvent>> {
        Ok(match self.monitor.receive()? {
            None => Drained::Nothing,
            Some(descriptor) => match self.classifier.classify(&descriptor) {
                Some(event) => Drained::Item(event),
                None => Drained::Dropped,
            },
        })
    }
}
