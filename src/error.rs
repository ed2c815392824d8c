// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the admin control plane.
//!
//! Internal failures are logged in full and only ever reach the wire as a
//! short message carrying a reference code, so operators can correlate a
//! client-visible failure with the server log without leaking paths, stack
//! traces or key material.

use chrono::Utc;
use rand::Rng;
use thiserror::Error;

/// Errors raised by the control plane.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("signature manifest error: {0}")]
    Manifest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("command registry is already finalized")]
    RegistryFinalized,

    #[error("command registry is not ready")]
    RegistryNotFinalized,

    #[error("command {command} is already registered in scope '{scope}'")]
    DuplicateCommand { scope: String, command: String },

    #[error("command handler failed: {0}")]
    Handler(String),

    #[error("operation timed out")]
    Timeout,
}

impl AdminError {
    /// Shorthand for handler failures.
    pub fn handler(msg: impl Into<String>) -> Self {
        AdminError::Handler(msg.into())
    }

    /// Whether the error describes a client mistake that may be shown verbatim.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            AdminError::Protocol(_) | AdminError::Authentication(_) | AdminError::Timeout
        )
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, AdminError>;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

/// Message sent to the client in place of an internal failure.
pub fn internal_error_message(reference: &str) -> String {
    format!("internal error (reference {})", reference)
}
