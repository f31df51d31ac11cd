//! Deploy Hook - Entry Point
//!
//! Listens for signed push webhooks and runs the configured deployment
//! command when the deployment branch receives a push.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use colored::Colorize;
use deployhook::app::options::AppOptions;
use deployhook::app::run::run;
use deployhook::errors::HookError;
use deployhook::filesys::file::File;
use deployhook::logs::{init_logging, LogOptions};
use deployhook::storage::layout::StorageLayout;
use deployhook::storage::settings::Settings;
use deployhook::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let settings = match load_settings(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!(
                "{} unable to load settings from {}: {}",
                "error:".red().bold(),
                settings_file.path().display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };

    let options = match AppOptions::from_settings(settings) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    // Validate the configuration and exit
    if cli_args.contains_key("check-config") {
        print_config_summary(&settings_file, &options).await;
        return ExitCode::SUCCESS;
    }

    // Initialize logging, the guard flushes file logs on exit
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    warn_if_readable_by_others(&settings_file).await;

    info!(
        "Running deploy hook {} ({}) with options: {:?}",
        version.version, version.git_hash, options
    );
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run the deploy hook: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn load_settings(file: &File) -> Result<Settings, HookError> {
    let mut settings = Settings::load(file).await?;
    settings.apply_env_overrides()?;
    Ok(settings)
}

async fn warn_if_readable_by_others(file: &File) {
    if !file.exists().await {
        return;
    }
    if let Ok(false) = file.is_owner_only().await {
        warn!(
            "Settings file {} is readable by other users and holds the webhook secret",
            file.path().display()
        );
    }
}

async fn print_config_summary(file: &File, options: &AppOptions) {
    let source = if file.exists().await {
        file.path().display().to_string()
    } else {
        "environment only".to_string()
    };

    println!("{} configuration is valid", "ok:".green().bold());
    println!("  {:<14}{}", "settings", source);
    println!(
        "  {:<14}{}:{}",
        "listen", options.server.host, options.server.port
    );
    println!("  {:<14}{}", "target ref", options.gate.target_ref.cyan());
    println!("  {:<14}{}", "skip marker", options.gate.skip_tag);
    println!(
        "  {:<14}{} {}",
        "command",
        options.executor.command.cyan(),
        options.executor.args.join(" ")
    );
    match options.executor.timeout {
        Some(timeout) => println!("  {:<14}{:?}", "timeout", timeout),
        None => println!("  {:<14}{}", "timeout", "none".yellow()),
    }
    println!("  {:<14}{:?}", "policy", options.policy);
    if options.webhook.allow_legacy_sha1 {
        println!(
            "{} legacy sha1 signatures are accepted",
            "warning:".yellow().bold()
        );
    }
    if let Ok(false) = file.is_owner_only().await {
        println!(
            "{} settings file is readable by other users",
            "warning:".yellow().bold()
        );
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    warn!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
