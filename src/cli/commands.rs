//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands.

use crate::cli::output::{self, RawRecord};
use crate::cli::{Args, Commands, ConfigCommands};
use crate::core::config::{get_config_path, Config};
use crate::device::{
    enumerate, Descriptor, Drained, EventSource, Monitor, MouseClassifier, MouseDevice,
    MouseMonitor, Registry,
};
use crate::testdb::{MockRegistry, Scenario, ScenarioLibrary, ScriptedEvent};
use anyhow::{anyhow, bail, Context as _, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;

/// How long a replayed session keeps watching after its last scripted event
const REPLAY_IDLE_EXIT: Duration = Duration::from_millis(200);

/// Run the command given on the command line
pub fn run_command(args: &Args, config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    match &args.command {
        None => list_devices(args, config, false),
        Some(Commands::List { raw }) => list_devices(args, config, *raw),
        Some(Commands::Monitor { raw, source }) => {
            let mut config = config.clone();
            if let Some(source) = source {
                config.monitor.source = *source;
            }
            monitor_devices(args, &config, *raw, shutdown)
        }
        Some(Commands::Scenarios { tag, run, export }) => {
            if let Some(name) = export {
                export_scenario(name)
            } else if *run {
                run_scenarios(tag.as_deref(), args.json)
            } else {
                list_scenarios(tag.as_deref());
                Ok(())
            }
        }
        Some(Commands::Config { action }) => match action {
            ConfigCommands::Show => show_config(config),
            ConfigCommands::Path => {
                println!("{}", Config::get_active_config_path().display());
                Ok(())
            }
            ConfigCommands::Generate { output, force } => {
                generate_config_file(output.clone(), *force)
            }
        },
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// The scenario named by `--fixture` or `--scenario`, if any
fn selected_scenario(args: &Args) -> Result<Option<Scenario>> {
    if let Some(path) = &args.fixture {
        let scenario = Scenario::from_toml_file(path)
            .with_context(|| format!("Failed to load fixture {}", path.display()))?;
        return Ok(Some(scenario));
    }
    if let Some(name) = &args.scenario {
        return ScenarioLibrary::by_name(name).map(Some).ok_or_else(|| {
            anyhow!(
                "Unknown scenario '{}'. Run 'mouse-watch scenarios' to list them.",
                name
            )
        });
    }
    Ok(None)
}

#[cfg(all(feature = "libudev", target_os = "linux"))]
fn system_registry() -> Result<crate::device::Libudev> {
    Ok(crate::device::Libudev::new())
}

#[cfg(not(all(feature = "libudev", target_os = "linux")))]
fn system_registry() -> Result<MockRegistry> {
    bail!(
        "This build has no system device registry. Rebuild on Linux with \
         --features libudev, or use --scenario / --fixture."
    )
}

// ============================================================================
// List
// ============================================================================

fn list_devices(args: &Args, config: &Config, raw: bool) -> Result<()> {
    match selected_scenario(args)? {
        Some(scenario) => {
            info!("Using scenario '{}' (in-memory registry)", scenario.name);
            list_with(&scenario.install(), config, raw, args.json)
        }
        None => list_with(&system_registry()?, config, raw, args.json),
    }
}

fn list_with<R: Registry>(registry: &R, config: &Config, raw: bool, json: bool) -> Result<()> {
    let mut enumeration = enumerate(registry, &config.enumerate, &config.classifier)?;

    if raw {
        for descriptor in enumeration.by_ref() {
            output::print_raw(&RawRecord::from_descriptor(&descriptor), json)?;
        }
    } else {
        let classifier = MouseClassifier::new(config.classifier.clone());
        let mice: Vec<MouseDevice> = enumeration
            .by_ref()
            .filter_map(|descriptor| classifier.describe(&descriptor))
            .collect();

        if !json && mice.is_empty() {
            output::print_info("No mice found");
        }
        for (index, mouse) in mice.iter().enumerate() {
            output::print_mouse(index, mouse, json)?;
        }
    }

    debug!("Enumeration: {:?}", enumeration.stats());
    Ok(())
}

// ============================================================================
// Monitor
// ============================================================================

/// Scripted events applied to an in-memory registry while monitoring
pub struct Replay {
    registry: MockRegistry,
    events: VecDeque<ScriptedEvent>,
    idle_exit: Duration,
}

impl Replay {
    pub fn new(registry: MockRegistry, events: Vec<ScriptedEvent>) -> Self {
        Self {
            registry,
            events: events.into(),
            idle_exit: REPLAY_IDLE_EXIT,
        }
    }

    pub fn with_idle_exit(mut self, idle_exit: Duration) -> Self {
        self.idle_exit = idle_exit;
        self
    }

    /// Wait before the next step
    fn next_delay(&self) -> Duration {
        self.events
            .front()
            .map_or(self.idle_exit, |event| Duration::from_millis(event.delay_ms))
    }

    /// Apply the next scripted event; false once the script is exhausted
    fn step(&mut self) -> bool {
        match self.events.pop_front() {
            Some(event) => {
                let delivered = event.apply(&self.registry);
                debug!(
                    "Replayed {} {} to {} monitor(s)",
                    event.action, event.syspath, delivered
                );
                true
            }
            None => false,
        }
    }
}

/// Readiness descriptor owned by an event source
struct ReadinessFd(RawFd);

impl AsRawFd for ReadinessFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Wait for readiness and drain `source` until shutdown, returning the number
/// of reported events
///
/// Readiness is only cleared once a drain comes back empty, so every queued
/// event is delivered.
pub async fn readiness_loop<S, F>(
    mut source: S,
    mut replay: Option<Replay>,
    mut shutdown: watch::Receiver<bool>,
    mut report: F,
) -> Result<usize>
where
    S: EventSource,
    F: FnMut(S::Event) -> Result<()>,
{
    let raw_fd = source.readiness_descriptor()?;
    // SAFETY: `source` owns the descriptor and outlives `fd`, which is
    // declared after it and dropped first.
    let fd = unsafe { AsyncFd::register_with_interest(ReadinessFd(raw_fd), Interest::READABLE) }?;
    let mut reported = 0;
    let mut wakeups = 0;

    while !*shutdown.borrow() {
        let delay = replay.as_ref().map(Replay::next_delay);

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() {
                    warn!("Shutdown channel closed");
                }
                break;
            }
            guard = fd.readable() => {
                let mut guard = guard?;
                match source.drain()? {
                    Drained::Nothing => {
                        wakeups += 1;
                        guard.clear_ready();
                    }
                    Drained::Dropped => {}
                    Drained::Item(event) => {
                        report(event)?;
                        reported += 1;
                    }
                }
            }
            _ = tokio::time::sleep(delay.unwrap_or_default()), if delay.is_some() => {
                // Queued events go out before the script changes the tree.
                reported += drain_queued(&mut source, &mut report)?;
                if let Some(replay) = replay.as_mut() {
                    if !replay.step() {
                        info!("Scenario script finished");
                        break;
                    }
                }
            }
        }
    }

    debug!("Readiness loop done: {} reported, {} wakeups", reported, wakeups);
    Ok(reported)
}

/// Drain without waiting for readiness
fn drain_queued<S, F>(source: &mut S, report: &mut F) -> Result<usize>
where
    S: EventSource,
    F: FnMut(S::Event) -> Result<()>,
{
    let mut reported = 0;
    loop {
        match source.drain()? {
            Drained::Nothing => return Ok(reported),
            Drained::Dropped => {}
            Drained::Item(event) => {
                report(event)?;
                reported += 1;
            }
        }
    }
}

fn monitor_devices(
    args: &Args,
    config: &Config,
    raw: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match selected_scenario(args)? {
        Some(scenario) => {
            info!("Replaying scenario '{}'", scenario.name);
            let registry = scenario.install();
            let replay = Replay::new(registry.clone(), scenario.events.clone());
            monitor_with(&registry, config, raw, args.json, Some(replay), shutdown)
        }
        None => monitor_with(&system_registry()?, config, raw, args.json, None, shutdown),
    }
}

fn monitor_with<R: Registry>(
    registry: &R,
    config: &Config,
    raw: bool,
    json: bool,
    replay: Option<Replay>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut monitor = Monitor::new(registry, config.monitor.source)?;
    monitor.add_filter(&config.monitor.subsystem, config.monitor.devtype.as_deref())?;
    monitor.start()?;

    if !json {
        output::print_info("Watching for mice (Ctrl+C to stop)");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the event loop")?;

    let reported = if raw {
        runtime.block_on(readiness_loop(
            monitor,
            replay,
            shutdown,
            |descriptor: Descriptor<R>| {
                output::print_raw(&RawRecord::from_descriptor(&descriptor), json)
            },
        ))?
    } else {
        let mice = MouseMonitor::new(monitor, MouseClassifier::new(config.classifier.clone()));
        runtime.block_on(readiness_loop(mice, replay, shutdown, |event| {
            output::print_mouse_event(&event, json)
        }))?
    };

    info!("Reported {} event(s)", reported);
    Ok(())
}

// ============================================================================
// Scenarios
// ============================================================================

fn scenarios_for(tag: Option<&str>) -> Vec<Scenario> {
    match tag {
        Some(tag) => ScenarioLibrary::scenarios_by_tag(tag),
        None => ScenarioLibrary::all_scenarios(),
    }
}

fn list_scenarios(tag: Option<&str>) {
    let scenarios = scenarios_for(tag);

    output::print_header("Available Scenarios");
    for scenario in &scenarios {
        println!(
            "  • {} - {} [{}]",
            scenario.name,
            scenario.description,
            scenario.tags.join(", ")
        );
    }
    println!();
    println!("Total: {} scenarios", scenarios.len());
}

fn run_scenarios(tag: Option<&str>, json: bool) -> Result<()> {
    let scenarios = scenarios_for(tag);
    if scenarios.is_empty() {
        bail!("No scenarios match");
    }

    if !json {
        output::print_header("Running Scenarios");
    }

    let mut failed = 0;
    for scenario in &scenarios {
        let report = scenario.run()?;
        if !report.passed() {
            failed += 1;
        }

        if json {
            output::print_json(&report)?;
        } else if report.passed() {
            output::print_success(&format!(
                "{} ({} mice, {} events)",
                report.name,
                report.mice.len(),
                report.events.len()
            ));
        } else {
            output::print_error(&report.name);
            for failure in &report.failures {
                println!("      {}", failure);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, scenarios.len());
    }
    if !json {
        println!();
        println!("All {} scenarios passed", scenarios.len());
    }
    Ok(())
}

fn export_scenario(name: &str) -> Result<()> {
    let scenario =
        ScenarioLibrary::by_name(name).ok_or_else(|| anyhow!("Unknown scenario '{}'", name))?;
    print!("{}", scenario.to_toml()?);
    Ok(())
}

// ============================================================================
// Config
// ============================================================================

fn show_config(config: &Config) -> Result<()> {
    match Config::find_config_file() {
        Some(path) => info!("Config file: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

fn generate_config_file(output: Option<std::path::PathBuf>, force: bool) -> Result<()> {
    let path = output
        .or_else(get_config_path)
        .ok_or_else(|| anyhow!("Could not determine config directory; use --output"))?;

    Config::write_default_config(&path, force)?;
    output::print_success(&format!("Wrote {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MouseAction, MouseEvent, MonitorSource};
    use crate::testdb::ScriptedEvent;

    const KEYBOARD_EVENT: &str = "/sys/devices/platform/i8042/serio0/input/input3/event2";

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn immediate(events: Vec<ScriptedEvent>) -> Vec<ScriptedEvent> {
        events.into_iter().map(|e| e.with_delay(0)).collect()
    }

    #[test]
    fn test_replay_reports_scripted_session() {
        let scenario = ScenarioLibrary::hotplug_session();
        let registry = scenario.install();
        let replay = Replay::new(registry.clone(), immediate(scenario.events.clone()))
            .with_idle_exit(Duration::from_millis(20));
        let mice = MouseMonitor::open(&registry, MonitorSource::Udev, MouseClassifier::default())
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let mut seen: Vec<MouseEvent> = Vec::new();
        let reported = block_on(readiness_loop(mice, Some(replay), rx, |event| {
            seen.push(event);
            Ok(())
        }))
        .unwrap();

        assert_eq!(reported, seen.len());
        let actions: Vec<MouseAction> = seen.iter().map(|e| e.action).collect();
        let expected: Vec<MouseAction> =
            scenario.expected.events.iter().map(|e| e.action).collect();
        assert_eq!(actions, expected);
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_replay_skips_spurious_wakeups() {
        let scenario = ScenarioLibrary::spurious_wakeups();
        let registry = scenario.install();
        let replay = Replay::new(registry.clone(), immediate(scenario.events.clone()))
            .with_idle_exit(Duration::from_millis(20));
        let mice = MouseMonitor::open(&registry, MonitorSource::Udev, MouseClassifier::default())
            .unwrap();
        let (_tx, rx) = watch::channel(false);

        let reported = block_on(readiness_loop(mice, Some(replay), rx, |_| Ok(()))).unwrap();
        assert_eq!(reported, scenario.expected.events.len());
    }

    #[test]
    fn test_raw_loop_reports_every_event() {
        let registry = ScenarioLibrary::hotplug_session().install();
        let script = immediate(vec![
            ScriptedEvent::new("change", KEYBOARD_EVENT),
            ScriptedEvent::new("change", KEYBOARD_EVENT),
        ]);
        let replay =
            Replay::new(registry.clone(), script).with_idle_exit(Duration::from_millis(20));
        let mut monitor = Monitor::new(&registry, MonitorSource::Udev).unwrap();
        monitor.add_filter("input", None).unwrap();
        monitor.start().unwrap();
        let (_tx, rx) = watch::channel(false);

        let reported = block_on(readiness_loop(monitor, Some(replay), rx, |_| Ok(()))).unwrap();
        assert_eq!(reported, 2);
    }

    #[test]
    fn test_shutdown_stops_loop() {
        let registry = ScenarioLibrary::single_mouse().install();
        let mice = MouseMonitor::open(&registry, MonitorSource::Udev, MouseClassifier::default())
            .unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let reported = block_on(readiness_loop(mice, None, rx, |_| Ok(()))).unwrap();
        assert_eq!(reported, 0);
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_report_error_ends_loop() {
        let registry = ScenarioLibrary::single_mouse().install();
        let mice = MouseMonitor::open(&registry, MonitorSource::Udev, MouseClassifier::default())
            .unwrap();
        registry.emit(
            "add",
            "/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/input/input7/event7",
        );
        let (_tx, rx) = watch::channel(false);

        let result = block_on(readiness_loop(mice, None, rx, |_| bail!("stdout closed")));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_scenario_is_an_error() {
        let args = Args {
            command: None,
            config: None,
            log_level: None,
            fixture: None,
            scenario: Some("no_such_scenario".to_string()),
            json: false,
        };
        assert!(selected_scenario(&args).is_err());
    }

    #[test]
    fn test_list_with_scenario() {
        let registry = ScenarioLibrary::touchpad_laptop().install();
        list_with(&registry, &Config::default(), false, true).unwrap();
        list_with(&registry, &Config::default(), true, true).unwrap();
        assert!(registry.ledger().is_balanced());
    }

    #[test]
    fn test_run_scenarios_all_pass() {
        run_scenarios(None, true).unwrap();
        assert!(run_scenarios(Some("no-such-tag"), true).is_err());
    }

    #[test]
    fn test_generate_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mouse_watch.toml");

        generate_config_file(Some(path.clone()), false).unwrap();
        assert!(generate_config_file(Some(path.clone()), false).is_err());
        generate_config_file(Some(path), true).unwrap();
    }
}
