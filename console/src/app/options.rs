//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::logs::{LogLevel, LogOptions};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Log level
    pub log_level: LogLevel,

    /// Emit console logs as JSON
    pub json_logs: bool,

    /// Log to stderr
    pub console_logs: bool,

    /// Directory for rotated log files
    pub log_dir: Option<PathBuf>,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Step executor configuration
    pub executor: ExecutorOptions,

    /// How often a foreground run checks whether its task has finished
    pub wait_poll_interval: Duration,
}

impl AppOptions {
    /// Resolve settings against a storage layout
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Self {
        Self {
            log_level: settings.log_level.clone(),
            json_logs: settings.json_logs,
            console_logs: settings.console_logs,
            log_dir: settings.log_dir.clone(),
            storage: StorageOptions {
                database_path: settings
                    .database_path
                    .clone()
                    .unwrap_or_else(|| layout.database_file()),
            },
            executor: ExecutorOptions {
                ansible_binary: settings.ansible_binary.clone(),
                inventory_path: settings
                    .inventory_path
                    .clone()
                    .unwrap_or_else(|| layout.inventory_file()),
                playbooks_dir: settings
                    .playbooks_dir
                    .clone()
                    .unwrap_or_else(|| layout.playbooks_dir()),
            },
            ..Default::default()
        }
    }

    /// Logging options derived from these options
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.log_level.clone(),
            console: self.console_logs,
            json_format: self.json_logs,
            log_dir: self.log_dir.clone(),
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        let layout = StorageLayout::default();
        Self {
            log_level: LogLevel::default(),
            json_logs: false,
            console_logs: true,
            log_dir: None,
            storage: StorageOptions {
                database_path: layout.database_file(),
            },
            executor: ExecutorOptions {
                ansible_binary: "ansible-playbook".to_string(),
                inventory_path: layout.inventory_file(),
                playbooks_dir: layout.playbooks_dir(),
            },
            wait_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// SQLite database file
    pub database_path: PathBuf,
}

/// Step executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Playbook runner binary
    pub ansible_binary: String,

    /// Inventory handed to every step
    pub inventory_path: PathBuf,

    /// Directory playbooks are resolved against
    pub playbooks_dir: PathBuf,
}
