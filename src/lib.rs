// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fladmin - admin control plane for a federated learning server
//!
//! Operators connect over mutual TLS, send one command per connection and
//! get back a structured reply. Commands are contributed by modules and
//! dispatched through a scoped registry.
//!
//! # Core Modules
//!
//! - [`server`] - Listener, TLS handshake and per-connection dispatch
//! - [`proto`] - Request and reply framing
//! - [`conn`] - Per-request connection state and reply buffer
//! - [`registry`] - Command modules, scopes, filters and authorization
//! - [`commands`] - Built-in, login and shell command modules
//! - [`security`] - Sessions, signed startup content and TLS helpers
//! - [`config`] - Server config file and launch overrides
//! - [`startup`] - Secure-mode checks and registry assembly
//! - [`error`] - Error types and reference codes

pub mod commands;
pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod proto;
pub mod registry;
pub mod security;
pub mod server;
pub mod startup;

pub use conn::{ConnProps, Connection, OutputItem, Table};
pub use error::{AdminError, Result};
pub use registry::{
    Action, AuthzContext, AuthzOutcome, CommandEntry, CommandFilter, CommandModule,
    CommandRegistry, CommandSpec, ModuleSpec,
};
pub use server::{AdminServer, ServerOptions, TlsFiles};
