// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security controls for the admin channel.
//!
//! - **Transport identity**: mutual TLS with a common-name allow-list ([`tls`])
//! - **Sessions**: opaque tokens with idle eviction ([`session_manager`])
//! - **Signed content**: RSA-PSS verified startup files ([`content`])
//! - **Lock hygiene**: poison-tolerant locking ([`locks`])
//!
//! ## Usage
//!
//! ```no_run
//! use fladmin::security::{SessionConfig, SessionManager};
//!
//! let manager = SessionManager::new(SessionConfig::default());
//! let session = manager.create_session("admin@org");
//! assert!(manager.mark_active(&session.token));
//! manager.end_session(&session.token);
//! manager.shutdown();
//! ```

pub mod content;
pub mod locks;
pub mod session_manager;
pub mod tls;

pub use content::{
    LoadResult, SecurityContentManager, SecurityContentService, ROOT_CERT, SIGNATURE_MANIFEST,
};
pub use locks::{resilient_lock, resilient_read, resilient_write};
pub use session_manager::{
    Session, SessionConfig, SessionEvent, SessionManager, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_MONITOR_INTERVAL_SECS, SESSION_SCOPE,
};
pub use tls::CnAllowList;
