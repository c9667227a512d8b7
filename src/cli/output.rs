//! Console output for CLI commands
//!
//! Human-readable lines by default; one JSON object per line with `--json`.

use crate::device::classifier::{MouseDevice, MouseEvent};
use crate::device::descriptor::{Descriptor, DeviceAttributes};
use crate::device::registry::Registry;
use anyhow::Result;
use serde::Serialize;
use std::io::Write;

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 60;
    let title_padded = format!("{:^width$}", title, width = width - 2);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

/// Print one value as a single JSON line
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn touchpad_tag(device: &MouseDevice) -> &'static str {
    if device.is_touchpad {
        " [touchpad]"
    } else {
        ""
    }
}

// ============================================================================
// Mice
// ============================================================================

/// Print a listed mouse
pub fn print_mouse(index: usize, device: &MouseDevice, json: bool) -> Result<()> {
    if json {
        return print_json(device);
    }
    println!("[{}] {}{}", index + 1, device.product_name, touchpad_tag(device));
    if let Some(syspath) = &device.syspath {
        println!("    {}", syspath);
    }
    Ok(())
}

/// Print a mouse hotplug event
pub fn print_mouse_event(event: &MouseEvent, json: bool) -> Result<()> {
    if json {
        return print_json(event);
    }
    println!(
        "{} {:>7}: {}{}",
        timestamp(),
        event.action.display_name(),
        event.device.product_name,
        touchpad_tag(&event.device)
    );
    Ok(())
}

// ============================================================================
// Raw descriptors
// ============================================================================

/// A descriptor as printed by `--raw`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub syspath: Option<String>,
    pub sys_name: Option<String>,
    pub subsystem: Option<String>,
    /// `NAME` of the node, else of its parent
    pub name: Option<String>,
}

impl RawRecord {
    pub fn from_descriptor<R: Registry>(descriptor: &Descriptor<R>) -> Self {
        let device = descriptor.device();
        Self {
            action: descriptor.action_name(),
            syspath: device.syspath(),
            sys_name: device.sys_name(),
            subsystem: device.subsystem(),
            name: device
                .property("NAME")
                .or_else(|| descriptor.parent().and_then(|p| p.property("NAME"))),
        }
    }

    /// `action: syspath (NAME)`
    pub fn line(&self) -> String {
        let mut line = String::new();
        if let Some(action) = &self.action {
            line.push_str(action);
            line.push_str(": ");
        }
        line.push_str(self.syspath.as_deref().unwrap_or("?"));
        if let Some(name) = &self.name {
            line.push_str(&format!(" ({})", name));
        }
        line
    }
}

/// Print a raw descriptor
pub fn print_raw(record: &RawRecord, json: bool) -> Result<()> {
    if json {
        return print_json(record);
    }
    println!("{}", record.line());
    Ok(())
}

// ============================================================================
// Logging target
// ============================================================================

/// Log target writing to both stderr and a file
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::enumerator::{enumerate, CanonicalPolicy, EnumerateFilter};
    use crate::testdb::ScenarioLibrary;

    #[test]
    fn test_raw_line_format() {
        let record = RawRecord {
            action: Some("add".to_string()),
            syspath: Some("/sys/devices/m1/event3".to_string()),
            sys_name: Some("event3".to_string()),
            subsystem: Some("input".to_string()),
            name: Some("\"Logi Mouse\"".to_string()),
        };
        assert_eq!(record.line(), "add: /sys/devices/m1/event3 (\"Logi Mouse\")");

        let listed = RawRecord {
            action: None,
            name: None,
            ..record
        };
        assert_eq!(listed.line(), "/sys/devices/m1/event3");
    }

    #[test]
    fn test_raw_record_uses_parent_name() {
        let registry = ScenarioLibrary::single_mouse().install();
        let records: Vec<RawRecord> = enumerate(
            &registry,
            &EnumerateFilter::mice(),
            &CanonicalPolicy::default(),
        )
        .unwrap()
        .map(|d| RawRecord::from_descriptor(&d))
        .collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sys_name.as_deref(), Some("event7"));
        assert_eq!(
            records[0].name.as_deref(),
            Some("Logitech USB Optical Mouse")
        );
        assert_eq!(records[0].action, None);
    }

    #[test]
    fn test_raw_record_json_omits_missing_action() {
        let record = RawRecord {
            action: None,
            syspath: Some("/sys/devices/m1".to_string()),
            sys_name: None,
            subsystem: None,
            name: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("action").is_none());
        assert_eq!(json["syspath"], "/sys/devices/m1");
    }
}
