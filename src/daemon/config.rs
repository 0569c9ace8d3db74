//! Daemon configuration parsing from tapeserverd.conf
//!
//! Shell-style `KEY=value` assignments:
//! - TAPESERVERD_FORKER_REPLY_TIMEOUT=seconds
//! - TAPESERVERD_FORKER_READ_TIMEOUT=seconds
//! - TAPESERVERD_FORKER_POLL_INTERVAL_MS=milliseconds
//! - TAPESERVERD_REACTOR_TIMEOUT_MS=milliseconds
//! - TAPESERVERD_SESSION_COMMAND="program"
//! - TAPESERVERD_DRIVE_<unit>="<logical-library> <dev-filename> <library-slot>"

use crate::daemon::forker::{ForkerConfig, DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT};
use crate::daemon::protocol::DriveConfig;
use crate::daemon::proxy::DEFAULT_REPLY_TIMEOUT;
use log::warn;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "TAPESERVERD_CONFIG";

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tapeserverd.conf";

pub const DEFAULT_REACTOR_TIMEOUT_MS: i32 = 100;

const DRIVE_PREFIX: &str = "TAPESERVERD_DRIVE_";

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// How long the daemon waits for each ProcessForker reply
    pub forker_reply_timeout: Duration,
    /// How long the ProcessForker waits for a request once one is pending
    pub forker_read_timeout: Duration,
    pub forker_poll_interval: Duration,
    /// Timeout handed to each `PollReactor::handle_events` call
    pub reactor_timeout_ms: i32,
    /// Program run by each session process
    pub session_command: Option<String>,
    /// Configured tape drives, sorted by unit name
    pub drives: Vec<DriveConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            forker_reply_timeout: DEFAULT_REPLY_TIMEOUT,
            forker_read_timeout: DEFAULT_READ_TIMEOUT,
            forker_poll_interval: DEFAULT_POLL_INTERVAL,
            reactor_timeout_ms: DEFAULT_REACTOR_TIMEOUT_MS,
            session_command: None,
            drives: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::from_file(&Self::config_path()).unwrap_or_default()
    }

    /// `$TAPESERVERD_CONFIG`, else the system file if it exists, else the
    /// per-user file
    pub fn config_path() -> PathBuf {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return system;
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tapeserverd.conf")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = DaemonConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "TAPESERVERD_FORKER_REPLY_TIMEOUT" => {
                    if let Some(secs) = parse_number::<u64>(&key, &value) {
                        config.forker_reply_timeout = Duration::from_secs(secs);
                    }
                }
                "TAPESERVERD_FORKER_READ_TIMEOUT" => {
                    if let Some(secs) = parse_number::<u64>(&key, &value) {
                        config.forker_read_timeout = Duration::from_secs(secs);
                    }
                }
                "TAPESERVERD_FORKER_POLL_INTERVAL_MS" => {
                    if let Some(ms) = parse_number::<u64>(&key, &value) {
                        config.forker_poll_interval = Duration::from_millis(ms);
                    }
                }
                "TAPESERVERD_REACTOR_TIMEOUT_MS" => {
                    if let Some(ms) = parse_number::<i32>(&key, &value) {
                        config.reactor_timeout_ms = ms;
                    }
                }
                "TAPESERVERD_SESSION_COMMAND" => {
                    config.session_command = (!value.is_empty()).then_some(value);
                }
                _ if key.starts_with(DRIVE_PREFIX) => {
                    let unit_name = &key[DRIVE_PREFIX.len()..];
                    match parse_drive(unit_name, &value) {
                        Some(drive) => {
                            config.drives.retain(|d| d.unit_name != drive.unit_name);
                            config.drives.push(drive);
                        }
                        None => warn!(
                            "Ignoring malformed drive configuration: {}=\"{}\": expected \"<logical-library> <dev-filename> <library-slot>\"",
                            key, value
                        ),
                    }
                }
                _ => {}
            }
        }

        config.drives.sort_by(|a, b| a.unit_name.cmp(&b.unit_name));
        config
    }

    pub fn forker_config(&self) -> ForkerConfig {
        ForkerConfig {
            read_timeout: self.forker_read_timeout,
            poll_interval: self.forker_poll_interval,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        warn!("Ignoring invalid value: {}=\"{}\"", key, value);
    }
    parsed
}

fn parse_drive(unit_name: &str, value: &str) -> Option<DriveConfig> {
    let mut fields = value.split_whitespace();
    let (Some(logical_library), Some(dev_filename), Some(library_slot), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return None;
    };
    if unit_name.is_empty() {
        return None;
    }
    Some(DriveConfig {
        unit_name: unit_name.to_string(),
        logical_library: logical_library.to_string(),
        dev_filename: dev_filename.to_string(),
        library_slot: library_slot.to_string(),
    })
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(DaemonConfig::parse(""), DaemonConfig::default());
        let config = DaemonConfig::default();
        assert_eq!(config.forker_reply_timeout, Duration::from_secs(10));
        assert_eq!(config.forker_read_timeout, Duration::from_secs(10));
        assert_eq!(config.forker_poll_interval, Duration::from_millis(100));
        assert_eq!(config.reactor_timeout_ms, 100);
    }

    #[test]
    fn test_parse_timeouts() {
        let content = r#"
TAPESERVERD_FORKER_REPLY_TIMEOUT=30
TAPESERVERD_FORKER_READ_TIMEOUT="5"
TAPESERVERD_FORKER_POLL_INTERVAL_MS=250
TAPESERVERD_REACTOR_TIMEOUT_MS=-1
"#;
        let config = DaemonConfig::parse(content);
        assert_eq!(config.forker_reply_timeout, Duration::from_secs(30));
        assert_eq!(config.reactor_timeout_ms, -1);

        let forker = config.forker_config();
        assert_eq!(forker.read_timeout, Duration::from_secs(5));
        assert_eq!(forker.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_number_keeps_default() {
        let config = DaemonConfig::parse("TAPESERVERD_FORKER_REPLY_TIMEOUT=soon\n");
        assert_eq!(config.forker_reply_timeout, DEFAULT_REPLY_TIMEOUT);
    }

    #[test]
    fn test_parse_drives() {
        let content = r#"
export TAPESERVERD_DRIVE_T10D6116="lib1 /dev/nst0 smc5"
TAPESERVERD_DRIVE_T10D6115='lib1 /dev/nst1 smc4'
TAPESERVERD_DRIVE_BROKEN="lib1 /dev/nst2"
"#;
        let config = DaemonConfig::parse(content);
        assert_eq!(config.drives.len(), 2);
        assert_eq!(config.drives[0].unit_name, "T10D6115");

        let drive = &config.drives[1];
        assert_eq!(drive.unit_name, "T10D6116");
        assert_eq!(drive.logical_library, "lib1");
        assert_eq!(drive.dev_filename, "/dev/nst0");
        assert_eq!(drive.library_slot, "smc5");
        assert!(config.drives.iter().all(|d| d.unit_name != "BROKEN"));
    }

    #[test]
    fn test_later_drive_definition_wins() {
        let content = "TAPESERVERD_DRIVE_D1=\"lib1 /dev/nst0 smc1\"\nTAPESERVERD_DRIVE_D1=\"lib2 /dev/nst9 smc2\"\n";
        let config = DaemonConfig::parse(content);
        assert_eq!(config.drives.len(), 1);
        assert_eq!(config.drives[0].logical_library, "lib2");
    }

    #[test]
    fn test_parse_comments_and_session_command() {
        let content = r#"
# Session program
TAPESERVERD_SESSION_COMMAND="/usr/libexec/tapeserver/session"
not an assignment
"#;
        let config = DaemonConfig::parse(content);
        assert_eq!(
            config.session_command.as_deref(),
            Some("/usr/libexec/tapeserver/session")
        );
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "TAPESERVERD_REACTOR_TIMEOUT_MS=250").unwrap();
        writeln!(file, "TAPESERVERD_DRIVE_T10D6116=\"lib1 /dev/nst0 smc5\"").unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reactor_timeout_ms, 250);
        assert_eq!(config.drives.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        assert!(DaemonConfig::from_file(&dir.path().join("missing.conf")).is_none());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("  \"hello\"  "), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
