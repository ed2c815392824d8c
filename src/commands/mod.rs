// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command modules shipped with the server.
//!
//! | Scope   | Module          | Commands                                  |
//! |---------|-----------------|-------------------------------------------|
//! | (none)  | [`BuiltinModule`] | `_commands`, `echo`                     |
//! | `login` | [`LoginModule`] | `_cert_login`, `_logout`, `_check_session` |
//! | `sess`  | `SessionManager` | `list_sessions`                          |
//! | `sys`   | [`ShellModule`] | `pwd`, `ls`, `cat`, `head`, `tail`, `grep`, `env` |

pub mod builtin;
pub mod login;
pub mod shell;

pub use builtin::{new_registry_with_builtins, BuiltinModule};
pub use login::{LoginModule, LOGIN_SCOPE, SESSION_INACTIVE};
pub use shell::{ClientRelay, ShellModule, SERVER_TARGET, SHELL_SCOPE};
