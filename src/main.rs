// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use fladmin::config::{parse_vars, LaunchOverrides};
use fladmin::security::{SecurityContentService, SessionManager};
use fladmin::startup;
use fladmin::AdminServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error, including startup files that failed verification
    pub const ERROR: i32 = 1;
    /// Invalid or missing config
    pub const CONFIG: i32 = 78;
}

#[derive(Parser)]
#[command(name = "fladmin-server")]
#[command(version = VERSION)]
#[command(about = "Admin command server for a federated learning deployment.")]
struct Cli {
    /// Workspace folder containing the startup kit
    #[arg(short = 'm', long, value_name = "DIR")]
    workspace: PathBuf,

    /// Server config file name inside the startup folder
    #[arg(short = 's', long, value_name = "FILE", default_value = "fed_server.json")]
    fed_server: String,

    /// Launch overrides, e.g. --set secure_train=true port=8003
    #[arg(long, value_name = "KEY=VALUE", num_args = 1..)]
    set: Vec<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    fladmin::logging::init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} failed to start async runtime: {}", "[!]".red(), e);
            std::process::exit(exit_codes::ERROR);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("{} {:#}", "[!]".red(), e);
        std::process::exit(exit_codes::CONFIG);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = LaunchOverrides::from_vars(&parse_vars(&cli.set)?)?;
    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", cli.workspace.display()))?;

    let content = SecurityContentService::new();
    let prepared = startup::prepare(&content, &workspace, &cli.fed_server, &overrides)
        .context("failed to load startup kit")?;

    if !prepared.insecure.is_empty() {
        eprintln!("{} the following files are not securely signed:", "[!]".red().bold());
        for file in &prepared.insecure {
            eprintln!("    {} ({})", file.name.yellow(), file.result);
        }
        std::process::exit(exit_codes::ERROR);
    }

    let server_config = prepared.config.primary()?;
    if let Some(storage) = startup::prepare_admin_storage(&workspace, server_config)? {
        tracing::info!(path = %storage.display(), "admin storage ready");
    }

    let sessions = Arc::new(SessionManager::new(server_config.session_config()));
    let registry = startup::build_registry(server_config, Arc::clone(&sessions), &workspace, None)?;

    let server = AdminServer::bind(prepared.options.clone(), registry)
        .await
        .context("failed to start admin server")?;
    server.start()?;

    println!(
        "{} admin server {} listening on {}{}",
        "[+]".green(),
        server_config.name.bold(),
        server.local_addr(),
        if server.is_tls() { " (mTLS)" } else { "" }
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    println!("{} shutting down", "[*]".cyan());

    server.stop().await;
    sessions.shutdown();
    Ok(())
}
