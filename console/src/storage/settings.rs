//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Console settings
///
/// Paths left unset resolve against the storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit console logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Log to stderr; turn off when only the log files are wanted
    #[serde(default = "default_console_logs")]
    pub console_logs: bool,

    /// Directory for rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// SQLite database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Inventory handed to every playbook run
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,

    /// Directory playbook identifiers are resolved against
    #[serde(default)]
    pub playbooks_dir: Option<PathBuf>,

    /// Playbook runner binary
    #[serde(default = "default_ansible_binary")]
    pub ansible_binary: String,
}

fn default_console_logs() -> bool {
    true
}

fn default_ansible_binary() -> String {
    "ansible-playbook".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            json_logs: false,
            console_logs: default_console_logs(),
            log_dir: None,
            database_path: None,
            inventory_path: None,
            playbooks_dir: None,
            ansible_binary: default_ansible_binary(),
        }
    }
}
