// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command descriptors and authorization types.

use std::fmt;
use std::sync::Arc;

use crate::conn::Connection;
use crate::error::Result;

/// Command handler. Output goes to the connection; `Err` is an internal failure.
pub type HandlerFn = Arc<dyn Fn(&mut Connection, &[String]) -> Result<()> + Send + Sync>;

/// Authorization function run before the handler.
pub type AuthzFn = Arc<dyn Fn(&mut Connection, &[String]) -> AuthzOutcome + Send + Sync>;

/// Kind of access a command needs on its target sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
}

/// What an authorization function learned about the command's targets.
///
/// Stored on the connection so the handler does not have to re-derive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzContext {
    pub site_names: Vec<String>,
    pub action: Action,
}

impl AuthzContext {
    pub fn new(site_names: Vec<String>, action: Action) -> Self {
        Self { site_names, action }
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzOutcome {
    Granted(Option<AuthzContext>),
    /// Denied with a message that is sent to the client as-is.
    Denied(String),
}

/// Command as described by its module.
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub handler: HandlerFn,
    pub authz: Option<AuthzFn>,
    pub visible: bool,
    pub confirm: bool,
}

impl CommandSpec {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        usage: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut Connection, &[String]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            usage: usage.into(),
            handler: Arc::new(handler),
            authz: None,
            visible: true,
            confirm: false,
        }
    }

    pub fn with_authz<F>(mut self, authz: F) -> Self
    where
        F: Fn(&mut Connection, &[String]) -> AuthzOutcome + Send + Sync + 'static,
    {
        self.authz = Some(Arc::new(authz));
        self
    }

    /// Keep the command out of listings and help.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Ask interactive clients to confirm before sending.
    pub fn confirm(mut self) -> Self {
        self.confirm = true;
        self
    }
}

/// A module's scope name and its commands.
pub struct ModuleSpec {
    pub name: String,
    pub commands: Vec<CommandSpec>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }
}

/// Registered command, bound to its scope.
#[derive(Clone)]
pub struct CommandEntry {
    pub scope: String,
    pub name: String,
    pub description: String,
    pub usage: String,
    pub handler: HandlerFn,
    pub authz: Option<AuthzFn>,
    pub visible: bool,
    pub confirm: bool,
}

impl CommandEntry {
    pub(crate) fn from_spec(scope: &str, spec: CommandSpec) -> Self {
        Self {
            scope: scope.to_string(),
            name: spec.name,
            description: spec.description,
            usage: spec.usage,
            handler: spec.handler,
            authz: spec.authz,
            visible: spec.visible,
            confirm: spec.confirm,
        }
    }

    /// `scope.command`, or the bare name for the unnamed scope.
    pub fn qualified_name(&self) -> String {
        if self.scope.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.scope, self.name)
        }
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .field("visible", &self.visible)
            .field("confirm", &self.confirm)
            .field("has_authz", &self.authz.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        let spec = CommandSpec::new("ls", "list", "ls target", |_, _| Ok(()));
        let entry = CommandEntry::from_spec("sys", spec);
        assert_eq!(entry.qualified_name(), "sys.ls");

        let spec = CommandSpec::new("echo", "echo", "echo", |_, _| Ok(()));
        let entry = CommandEntry::from_spec("", spec);
        assert_eq!(entry.qualified_name(), "echo");
    }

    #[test]
    fn test_spec_builders() {
        let spec = CommandSpec::new("_logout", "end session", "_logout", |_, _| Ok(()))
            .hidden()
            .confirm()
            .with_authz(|_, _| AuthzOutcome::Granted(None));
        assert!(!spec.visible);
        assert!(spec.confirm);
        assert!(spec.authz.is_some());
    }
}
