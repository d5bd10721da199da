//! Provisioning Console - Entry Point
//!
//! Drives playbook sequences that deploy and tear down lab components, and
//! keeps a durable record of every task, component state and operation.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use provconsole::app::options::AppOptions;
use provconsole::app::run::{run, Command};
use provconsole::filesys::file::File;
use provconsole::logs::init_logging;
use provconsole::storage::layout::StorageLayout;
use provconsole::storage::settings::Settings;
use provconsole::utils::version_info;

use anyhow::Context;
use tracing::{error, info};

const USAGE: &str = "Usage: provconsole [--config=<path>] <command>

Commands:
  --version                          Print version information
  --init                             Write a default settings file
  --migrate                          Apply pending schema migrations
  --sequences                        List playbook sequences
  --run=<sequence> [--component=<c>] Run a sequence; Ctrl+C cancels it
  --status                           Show component deployment states
  --tasks [--task-status=<s>] [--component=<c>] [--limit=<n>]
                                     List recent tasks
  --history [--limit=<n>]            Show the operations log";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let layout = StorageLayout::default();
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };

    if cli_args.contains_key("init") {
        return init_settings(&settings_file).await;
    }

    let command = match Command::from_args(&cli_args) {
        Ok(Some(command)) => command,
        Ok(None) => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    // Retrieve the settings file
    let options = match load_options(&settings_file, &layout).await {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _log_guard = match init_logging(options.log_options()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(version = %version.version, ?command, "Running provisioning console");
    match run(command, &options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn load_options(settings_file: &File, layout: &StorageLayout) -> anyhow::Result<AppOptions> {
    let settings = settings_file
        .read_json_or_default::<Settings>()
        .await
        .with_context(|| {
            format!(
                "Unable to read settings file {}",
                settings_file.path().display()
            )
        })?;
    Ok(AppOptions::from_settings(&settings, layout))
}

async fn init_settings(settings_file: &File) -> ExitCode {
    if settings_file.exists().await {
        eprintln!(
            "Settings file already exists: {}",
            settings_file.path().display()
        );
        return ExitCode::FAILURE;
    }
    match settings_file.write_json(&Settings::default()).await {
        Ok(()) => {
            println!("Wrote {}", settings_file.path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to write settings file: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            return std::future::pending().await;
        }
        info!("Ctrl+C received, cancelling...");
    }
}
