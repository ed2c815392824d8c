// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server assembly: signed-content checks, config loading, registry wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;

use crate::commands::{new_registry_with_builtins, ClientRelay, LoginModule, ShellModule};
use crate::config::{AdminServerConfig, FedServerConfig, LaunchOverrides, AUTHORIZATION_FILE};
use crate::error::Result;
use crate::registry::CommandRegistry;
use crate::security::{
    LoadResult, SecurityContentService, SessionManager, ROOT_CERT, SIGNATURE_MANIFEST,
};
use crate::server::ServerOptions;

/// A startup file that did not verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsecureFile {
    pub name: String,
    pub result: LoadResult,
}

/// Check every file secure mode depends on.
///
/// Returns the files that are not trusted; empty means the startup kit is
/// intact. The config file, every certificate it names, and the
/// authorization policy (when the manifest lists it) must all verify.
pub fn check_secure_content(
    service: &SecurityContentService,
    config_file: &str,
    config: &FedServerConfig,
) -> Vec<InsecureFile> {
    let mut names: IndexSet<String> = IndexSet::new();
    names.insert(config_file.to_string());
    for server in &config.servers {
        names.extend(server.cert_file_names().into_iter().map(str::to_string));
    }
    if service
        .manager()
        .map_or(false, |m| m.is_signed(AUTHORIZATION_FILE))
    {
        names.insert(AUTHORIZATION_FILE.to_string());
    }

    names
        .into_iter()
        .filter_map(|name| {
            let (_, result) = service.load_content(&name);
            if result.is_trusted() {
                None
            } else {
                tracing::error!(file = %name, result = %result, "startup file failed verification");
                Some(InsecureFile { name, result })
            }
        })
        .collect()
}

/// Load the server config through the content service.
///
/// Falls back to a plain read when the startup folder is not managed.
pub fn load_server_config(
    service: &SecurityContentService,
    startup: &Path,
    config_file: &str,
) -> Result<FedServerConfig> {
    match service.load_json(config_file) {
        (Some(value), result) => {
            if !result.is_trusted() {
                tracing::warn!(
                    file = config_file,
                    result = %result,
                    "using unverified server config"
                );
            }
            FedServerConfig::from_json(value)
        }
        (None, _) => FedServerConfig::load(&startup.join(config_file)),
    }
}

/// Ensure the admin storage directory exists, relative to the workspace.
pub fn prepare_admin_storage(
    workspace: &Path,
    server: &AdminServerConfig,
) -> Result<Option<PathBuf>> {
    let Some(storage) = &server.admin_storage else {
        return Ok(None);
    };
    let path = workspace.join(storage);
    std::fs::create_dir_all(&path)?;
    Ok(Some(path))
}

/// Build and finalize the registry for `server`.
///
/// Registers the built-in, session, login and shell modules; installs the
/// login gate when the server requires login.
pub fn build_registry(
    server: &AdminServerConfig,
    sessions: Arc<SessionManager>,
    work_dir: &Path,
    relay: Option<Arc<dyn ClientRelay>>,
) -> Result<Arc<CommandRegistry>> {
    let registry = new_registry_with_builtins()?;
    registry.register_module(sessions.clone())?;

    let login = Arc::new(LoginModule::new(sessions));
    registry.register_module(login.clone())?;
    if server.require_login {
        registry.add_filter(login)?;
    }

    let timeout = server.request_timeout_duration();
    let mut shell = ShellModule::new().with_work_dir(work_dir).with_timeout(timeout);
    if let Some(relay) = relay {
        shell = shell.with_relay(relay, timeout);
    }
    registry.register_module(Arc::new(shell))?;

    registry.finalize()?;
    Ok(Arc::new(registry))
}

/// Everything `main` needs to start serving.
pub struct Prepared {
    pub startup: PathBuf,
    pub config: FedServerConfig,
    /// Listener settings for the primary server.
    pub options: ServerOptions,
    pub insecure: Vec<InsecureFile>,
}

/// Initialize the content service and load the config for `workspace`.
///
/// In secure mode the primary server must name its certificate files; the
/// listener is never downgraded to plaintext.
pub fn prepare(
    service: &SecurityContentService,
    workspace: &Path,
    config_file: &str,
    overrides: &LaunchOverrides,
) -> Result<Prepared> {
    let startup = overrides.startup_dir(workspace);
    service.initialize(&startup, SIGNATURE_MANIFEST, ROOT_CERT)?;

    let config = load_server_config(service, &startup, config_file)?;
    let options = config.primary()?.server_options(&startup, overrides)?;
    let insecure = if overrides.secure_train {
        check_secure_content(service, config_file, &config)
    } else {
        Vec::new()
    };
    Ok(Prepared {
        startup,
        config,
        options,
        insecure,
    })
}
