// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Certificate login and the session gate.
//!
//! `_cert_login` binds a session to the TLS client identity. When installed
//! as a [`CommandFilter`], every command outside the login scope needs a
//! live session token; the session is refreshed and its user recorded on
//! the connection.

use std::sync::Arc;

use crate::conn::Connection;
use crate::registry::{CommandEntry, CommandFilter, CommandModule, CommandSpec, ModuleSpec};
use crate::security::SessionManager;

pub const LOGIN_SCOPE: &str = "login";

/// Reply for a missing or expired session.
pub const SESSION_INACTIVE: &str = "session_inactive";

pub struct LoginModule {
    sessions: Arc<SessionManager>,
}

impl LoginModule {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    fn cert_login(&self, conn: &mut Connection, args: &[String]) {
        let [_, user] = args else {
            conn.append_error("syntax error: usage: _cert_login <user>");
            return;
        };

        if let Some(cn) = &conn.props.client_cn {
            if cn != user {
                tracing::warn!(cn = %cn, user = %user, "certificate login rejected: CN mismatch");
                conn.append_error("authentication error: certificate does not belong to user");
                return;
            }
        }

        let session = self.sessions.create_session(user.clone());
        conn.props.user_name = Some(session.user_name.clone());
        conn.append_token(session.token);
    }

    fn logout(&self, conn: &mut Connection) {
        if let Some(token) = conn.props.session_token.clone() {
            self.sessions.end_session(&token);
        }
        conn.append_string("logout successful");
    }

    fn check_session(&self, conn: &mut Connection) {
        let active = conn
            .props
            .session_token
            .as_deref()
            .map_or(false, |token| self.sessions.mark_active(token));
        if active {
            conn.append_string("session_active");
        } else {
            conn.append_error(SESSION_INACTIVE);
        }
    }
}

impl CommandModule for LoginModule {
    fn spec(self: Arc<Self>) -> ModuleSpec {
        let login = Arc::clone(&self);
        let logout = Arc::clone(&self);
        let check = Arc::clone(&self);
        ModuleSpec::new(
            LOGIN_SCOPE,
            vec![
                CommandSpec::new(
                    "_cert_login",
                    "login with client certificate",
                    "_cert_login <user>",
                    move |conn, args| {
                        login.cert_login(conn, args);
                        Ok(())
                    },
                )
                .hidden(),
                CommandSpec::new("_logout", "end the current session", "_logout", move |conn, _| {
                    logout.logout(conn);
                    Ok(())
                })
                .hidden(),
                CommandSpec::new(
                    "_check_session",
                    "check whether the session is active",
                    "_check_session",
                    move |conn, _| {
                        check.check_session(conn);
                        Ok(())
                    },
                )
                .hidden(),
            ],
        )
    }
}

impl CommandFilter for LoginModule {
    fn pre_command(&self, conn: &mut Connection, entry: &CommandEntry, _args: &[String]) -> bool {
        if entry.scope == LOGIN_SCOPE {
            return true;
        }

        let session = conn
            .props
            .session_token
            .as_deref()
            .and_then(|token| self.sessions.get_session(token));
        let Some(session) = session else {
            conn.append_error(SESSION_INACTIVE);
            conn.append_string("user not authenticated or session timed out");
            return false;
        };

        self.sessions.mark_active(&session.token);
        conn.props.user_name = Some(session.user_name);
        true
    }
}
