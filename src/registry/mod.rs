// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command registry and dispatch.
//!
//! Commands are contributed by [`CommandModule`] providers. Each module owns
//! one scope (a name prefix such as `sys` or `sess`) and a list of
//! [`CommandSpec`]s. The registry resolves the first token of a command line
//! to an entry, runs the registered filters and the entry's authorization
//! function, and only then calls the handler.
//!
//! # Lifecycle
//!
//! 1. `register_module` / `add_filter` during startup
//! 2. `finalize` exactly once
//! 3. `process_command` for every request
//! 4. `close` on shutdown or replacement, which tears down module workers

mod entry;

pub use entry::{
    Action, AuthzContext, AuthzFn, AuthzOutcome, CommandEntry, CommandSpec, HandlerFn, ModuleSpec,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;

use crate::conn::Connection;
use crate::error::{AdminError, Result};
use crate::security::locks::{resilient_lock, resilient_read, resilient_write};

/// Provider of a scope of commands.
pub trait CommandModule: Send + Sync {
    /// Describe the module's scope and commands.
    fn spec(self: Arc<Self>) -> ModuleSpec;

    /// Release resources owned by the module (background workers, handles).
    fn close(&self) {}
}

/// Check run before authorization for every command.
///
/// A filter that returns `false` must have appended an error explaining why.
pub trait CommandFilter: Send + Sync {
    fn pre_command(&self, conn: &mut Connection, entry: &CommandEntry, args: &[String]) -> bool;
}

/// Named group of commands.
#[derive(Clone, Default)]
pub struct Scope {
    pub name: String,
    entries: IndexMap<String, CommandEntry>,
}

impl Scope {
    pub fn entries(&self) -> impl Iterator<Item = &CommandEntry> {
        self.entries.values()
    }

    pub fn get(&self, command: &str) -> Option<&CommandEntry> {
        self.entries.get(command)
    }
}

/// Shared, read-mostly view of all registered scopes.
///
/// Cloning is cheap; modules that need to introspect the registry (help,
/// command listing) hold one of these instead of the registry itself.
#[derive(Clone, Default)]
pub struct CommandTable {
    scopes: Arc<RwLock<IndexMap<String, Scope>>>,
}

impl CommandTable {
    /// Every visible entry whose command name is `name`, across all scopes.
    pub fn get_command_entries(&self, name: &str) -> Vec<CommandEntry> {
        resilient_read(&self.scopes)
            .values()
            .filter_map(|scope| scope.get(name))
            .filter(|entry| entry.visible)
            .cloned()
            .collect()
    }

    /// Visible entries sorted by scope name, then command name.
    pub fn visible_entries(&self) -> Vec<CommandEntry> {
        let mut entries: Vec<CommandEntry> = resilient_read(&self.scopes)
            .values()
            .flat_map(|scope| scope.entries())
            .filter(|entry| entry.visible)
            .cloned()
            .collect();
        entries.sort_by(|a, b| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));
        entries
    }

    pub fn scope_names(&self) -> Vec<String> {
        resilient_read(&self.scopes).keys().cloned().collect()
    }

    /// Resolve a possibly scope-qualified command name (`scope.command`).
    ///
    /// A bare name is ambiguous when visible entries in more than one scope
    /// carry it.
    fn resolve(&self, name: &str) -> std::result::Result<CommandEntry, String> {
        let scopes = resilient_read(&self.scopes);

        if let Some((scope_name, command)) = name.split_once('.') {
            return scopes
                .get(scope_name)
                .and_then(|scope| scope.get(command))
                .cloned()
                .ok_or_else(|| format!("undefined command {}", name));
        }

        // Hidden entries only answer a bare name nothing visible claims.
        let all: Vec<&CommandEntry> = scopes.values().filter_map(|scope| scope.get(name)).collect();
        let mut matches: Vec<&CommandEntry> = all.iter().copied().filter(|e| e.visible).collect();
        if matches.is_empty() {
            matches = all;
        }
        match matches.len() {
            0 => Err(format!("undefined command {}", name)),
            1 => Ok(matches.remove(0).clone()),
            _ => {
                let qualified: Vec<String> =
                    matches.iter().map(|e| e.qualified_name()).collect();
                Err(format!(
                    "ambiguous command {} - qualify it with a scope: {}",
                    name,
                    qualified.join(", ")
                ))
            }
        }
    }
}

/// Dispatch table assembled from command modules.
pub struct CommandRegistry {
    table: CommandTable,
    modules: Mutex<Vec<Arc<dyn CommandModule>>>,
    filters: RwLock<Vec<Arc<dyn CommandFilter>>>,
    finalized: AtomicBool,
    closed: AtomicBool,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            table: CommandTable::default(),
            modules: Mutex::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            finalized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Handle on the command table for introspection.
    pub fn table(&self) -> CommandTable {
        self.table.clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Add a module's scope and commands.
    ///
    /// Nothing is inserted if any of the module's commands collides with an
    /// existing command of the same scope.
    pub fn register_module(&self, module: Arc<dyn CommandModule>) -> Result<()> {
        if self.is_finalized() {
            return Err(AdminError::RegistryFinalized);
        }

        let spec = Arc::clone(&module).spec();
        {
            let mut scopes = resilient_write(&self.table.scopes);
            let existing = scopes.get(&spec.name);

            let mut seen = std::collections::HashSet::new();
            for command in &spec.commands {
                let taken = existing
                    .map_or(false, |scope| scope.entries.contains_key(&command.name));
                if taken || !seen.insert(command.name.as_str()) {
                    return Err(AdminError::DuplicateCommand {
                        scope: spec.name.clone(),
                        command: command.name.clone(),
                    });
                }
            }

            let scope = scopes.entry(spec.name.clone()).or_insert_with(|| Scope {
                name: spec.name.clone(),
                entries: IndexMap::new(),
            });
            for command in spec.commands {
                let entry = CommandEntry::from_spec(&spec.name, command);
                scope.entries.insert(entry.name.clone(), entry);
            }
        }

        tracing::debug!(scope = %spec.name, "registered command module");
        resilient_lock(&self.modules).push(module);
        Ok(())
    }

    /// Install a filter that runs before every command.
    pub fn add_filter(&self, filter: Arc<dyn CommandFilter>) -> Result<()> {
        if self.is_finalized() {
            return Err(AdminError::RegistryFinalized);
        }
        resilient_write(&self.filters).push(filter);
        Ok(())
    }

    /// Freeze the registry. May only be called once.
    pub fn finalize(&self) -> Result<()> {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AdminError::RegistryFinalized);
        }

        let scopes = resilient_read(&self.table.scopes);
        let commands: usize = scopes.values().map(|s| s.entries.len()).sum();
        tracing::info!(scopes = scopes.len(), commands, "command registry finalized");
        Ok(())
    }

    /// Every visible entry named `name`, across all scopes.
    pub fn get_command_entries(&self, name: &str) -> Vec<CommandEntry> {
        self.table.get_command_entries(name)
    }

    /// Tokenize, resolve, authorize and execute one command line.
    ///
    /// Resolution and authorization failures are reported on `conn`;
    /// `Err` is only returned when the handler itself fails.
    pub fn process_command(&self, conn: &mut Connection, command_line: &str) -> Result<()> {
        if !self.is_finalized() {
            conn.append_error(AdminError::RegistryNotFinalized.to_string());
            return Ok(());
        }

        let Some(args) = shlex::split(command_line) else {
            conn.append_error("syntax error: unbalanced quotes in command");
            return Ok(());
        };
        let Some(name) = args.first() else {
            conn.append_error("empty command");
            return Ok(());
        };

        let entry = match self.table.resolve(name) {
            Ok(entry) => entry,
            Err(msg) => {
                conn.append_error(msg);
                return Ok(());
            }
        };

        // Snapshot so no registry lock is held while filters and handlers run.
        let filters: Vec<Arc<dyn CommandFilter>> = resilient_read(&self.filters).clone();
        for filter in &filters {
            if !filter.pre_command(conn, &entry, &args) {
                tracing::debug!(command = %entry.qualified_name(), "command rejected by filter");
                return Ok(());
            }
        }

        if let Some(authz) = &entry.authz {
            match authz(conn, &args) {
                AuthzOutcome::Granted(ctx) => conn.props.authz_ctx = ctx,
                AuthzOutcome::Denied(msg) => {
                    tracing::debug!(
                        command = %entry.qualified_name(),
                        reason = %msg,
                        "authorization denied"
                    );
                    conn.append_error(msg);
                    return Ok(());
                }
            }
        }

        (entry.handler)(conn, &args)
    }

    /// Tear down every registered module. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let modules: Vec<Arc<dyn CommandModule>> = resilient_lock(&self.modules).clone();
        for module in modules {
            module.close();
        }
        tracing::debug!("command registry closed");
    }
}
