// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-request connection transcript.
//!
//! A [`Connection`] is created for every accepted request. Command handlers
//! append lines, tables and errors to it; the accumulated output is rendered
//! as a single reply when the connection is closed. Once the reply has been
//! sent nothing else reaches the transport.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio_util::io::SyncIoBridge;

use crate::proto::{self, ReplyItem};
use crate::registry::AuthzContext;

/// Blocking byte sink a [`Connection`] writes its reply to.
pub trait Transport: Send {
    /// Write the whole buffer.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and close the write side.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl<W> Transport for SyncIoBridge<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        SyncIoBridge::shutdown(self)
    }
}

/// A rendered table: header row plus data rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(headers: &[&str]) -> Self {
        Self {
            rows: vec![headers.iter().map(|h| h.to_string()).collect()],
        }
    }

    /// Append a data row.
    pub fn add_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    pub fn headers(&self) -> &[String] {
        &self.rows[0]
    }

    /// Data rows, excluding the header.
    pub fn data_rows(&self) -> &[Vec<String>] {
        &self.rows[1..]
    }

    pub(crate) fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }
}

/// One piece of accumulated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputItem {
    Line(String),
    Error(String),
    Table(Table),
    Token(String),
}

/// Well-known connection properties plus a free-form extension map.
///
/// Values set while authorizing a command are read back by its handler on
/// the same connection.
#[derive(Debug, Default, Clone)]
pub struct ConnProps {
    /// Common name of the verified TLS client certificate.
    pub client_cn: Option<String>,
    /// Context produced by the command's authorization function.
    pub authz_ctx: Option<AuthzContext>,
    /// Session token supplied with the request.
    pub session_token: Option<String>,
    /// User bound to the session, once confirmed.
    pub user_name: Option<String>,
    extras: HashMap<String, Value>,
}

impl ConnProps {
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extras.insert(key.into(), value);
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn remove_extra(&mut self, key: &str) -> Option<Value> {
        self.extras.remove(key)
    }
}

/// Transcript of a single admin request.
pub struct Connection {
    transport: Option<Box<dyn Transport>>,
    peer: Option<SocketAddr>,
    output: Vec<OutputItem>,
    /// Typed property bag shared by the authorization and execution phases.
    pub props: ConnProps,
    /// Parsed request envelope, once decoded.
    pub request: Option<Value>,
    ended: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("output", &self.output)
            .field("props", &self.props)
            .field("ended", &self.ended)
            .finish()
    }
}

impl Connection {
    /// Connection that writes its reply to `transport`.
    pub fn new(transport: Box<dyn Transport>, peer: Option<SocketAddr>) -> Self {
        Self {
            transport: Some(transport),
            peer,
            output: Vec::new(),
            props: ConnProps::default(),
            request: None,
            ended: false,
        }
    }

    /// Connection with no transport; output is only kept in memory.
    pub fn detached() -> Self {
        Self {
            transport: None,
            peer: None,
            output: Vec::new(),
            props: ConnProps::default(),
            request: None,
            ended: false,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn push(&mut self, item: OutputItem) {
        if self.ended {
            tracing::debug!(peer = ?self.peer, "reply already sent; dropping output");
            return;
        }
        self.output.push(item);
    }

    pub fn append_string(&mut self, line: impl Into<String>) {
        self.push(OutputItem::Line(line.into()));
    }

    pub fn append_error(&mut self, msg: impl Into<String>) {
        self.push(OutputItem::Error(msg.into()));
    }

    pub fn append_token(&mut self, token: impl Into<String>) {
        self.push(OutputItem::Token(token.into()));
    }

    /// Start a new table and return it for row insertion.
    ///
    /// Returns `None` once the reply has been sent.
    pub fn append_table(&mut self, headers: &[&str]) -> Option<&mut Table> {
        if self.ended {
            return None;
        }
        self.output.push(OutputItem::Table(Table::new(headers)));
        match self.output.last_mut() {
            Some(OutputItem::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn output(&self) -> &[OutputItem] {
        &self.output
    }

    /// Error messages appended so far, in order.
    pub fn errors(&self) -> Vec<&str> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Error(msg) => Some(msg.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Plain lines appended so far, in order.
    pub fn lines(&self) -> Vec<&str> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Line(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tables(&self) -> Vec<&Table> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::Table(table) => Some(table),
                _ => None,
            })
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.output.iter().any(|item| matches!(item, OutputItem::Error(_)))
    }

    /// Whether the reply has already been sent.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Render the accumulated output and send it as the reply.
    ///
    /// Calling `close` more than once is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        let items: Vec<ReplyItem> = self.output.iter().cloned().map(ReplyItem::from).collect();
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        let bytes = proto::encode_reply(&items)?;
        transport.send(&bytes)?;
        transport.shutdown()
    }
}
