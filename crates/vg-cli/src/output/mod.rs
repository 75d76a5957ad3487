//! Output formatting utilities for the CLI
//!
//! Tables for the server list, one-line renderings of statuses and
//! statistics, and coloured status messages.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use vg_core::{ConnectionStatus, ServerIdentity};

/// Fields of a statistics snapshot shown on one line
const SNAPSHOT_FIELDS: usize = 6;

/// Format the configured servers as an ASCII table
///
/// The detailed view shows full IDs and the pinned host key.
pub fn format_servers(servers: &[ServerIdentity], detailed: bool) -> String {
    if servers.is_empty() {
        return "No servers configured".to_string();
    }

    #[derive(Tabled)]
    struct ServerRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ADDRESS")]
        address: String,
        #[tabled(rename = "AGENT PORT")]
        agent_port: u16,
        #[tabled(rename = "LOGIN")]
        login: &'static str,
    }

    #[derive(Tabled)]
    struct ServerRowDetailed {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ADDRESS")]
        address: String,
        #[tabled(rename = "AGENT PORT")]
        agent_port: u16,
        #[tabled(rename = "LOGIN")]
        login: &'static str,
        #[tabled(rename = "HOST KEY")]
        host_key: String,
    }

    if detailed {
        let rows: Vec<ServerRowDetailed> = servers
            .iter()
            .map(|s| ServerRowDetailed {
                id: s.id.to_string(),
                name: s.name.clone(),
                address: login_address(s),
                agent_port: s.agent_port,
                login: login_method(s),
                host_key: s.host_key.clone().unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        Table::new(rows).with(Style::rounded()).to_string()
    } else {
        let rows: Vec<ServerRow> = servers
            .iter()
            .map(|s| ServerRow {
                id: truncate(s.id.as_str(), 8),
                name: s.name.clone(),
                address: login_address(s),
                agent_port: s.agent_port,
                login: login_method(s),
            })
            .collect();
        Table::new(rows).with(Style::rounded()).to_string()
    }
}

fn login_address(server: &ServerIdentity) -> String {
    format!("{}@{}", server.username, server.ssh_address())
}

fn login_method(server: &ServerIdentity) -> &'static str {
    if server.has_key_installed {
        "key"
    } else {
        "password"
    }
}

/// Render a statistics snapshot on one line.
///
/// Top-level scalar fields of an object are shown as `key=value`; anything
/// else is shown as compact JSON.
pub fn format_snapshot(snapshot: &Value) -> String {
    let Value::Object(fields) = snapshot else {
        return snapshot.to_string();
    };

    let mut parts: Vec<String> = fields
        .iter()
        .filter(|(_, value)| !value.is_object() && !value.is_array())
        .take(SNAPSHOT_FIELDS)
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();

    if parts.is_empty() {
        return snapshot.to_string();
    }
    let scalars = fields
        .values()
        .filter(|value| !value.is_object() && !value.is_array())
        .count();
    if scalars > SNAPSHOT_FIELDS {
        parts.push("...".to_string());
    }
    parts.join(" ")
}

/// Colour used for a status
fn status_color(status: ConnectionStatus) -> Color {
    match status {
        ConnectionStatus::Connected => Color::Green,
        ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => Color::Cyan,
        ConnectionStatus::AgentOffline => Color::Yellow,
        ConnectionStatus::AuthFailed => Color::Red,
        ConnectionStatus::Disconnected => Color::DarkGrey,
    }
}

/// Print `name` followed by its coloured status
pub fn print_status(name: &str, status: ConnectionStatus) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        Print(format!("{:<20} ", name)),
        SetForegroundColor(status_color(status)),
        Print(status.to_string()),
        ResetColor,
        Print("\n")
    );
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix to stderr
pub fn print_error(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_shows_scalar_fields() {
        let line = format_snapshot(&json!({ "cpu": 12.5, "host": "pi", "disks": [1, 2] }));
        assert!(line.contains("cpu=12.5"));
        assert!(line.contains("host=pi"));
        assert!(!line.contains("disks"));
    }

    #[test]
    fn test_snapshot_without_scalars_is_raw_json() {
        assert_eq!(format_snapshot(&json!([1, 2])), "[1,2]");
        assert_eq!(format_snapshot(&json!({ "a": {} })), "{\"a\":{}}");
    }

    #[test]
    fn test_snapshot_elides_extra_fields() {
        let line = format_snapshot(&json!({
            "a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6, "g": 7
        }));
        assert!(line.ends_with("..."));
    }

    #[test]
    fn test_server_table_marks_login_method() {
        let mut keyed = ServerIdentity::new("10.0.0.5", "pi");
        keyed.has_key_installed = true;
        let fresh = ServerIdentity::new("nas.local", "admin");

        let table = format_servers(&[keyed, fresh], false);
        assert!(table.contains("pi@10.0.0.5:22"));
        assert!(table.contains("key"));
        assert!(table.contains("password"));
        assert_eq!(format_servers(&[], false), "No servers configured");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("héllo", 8), "héllo");
    }
}
