// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admin wire protocol.
//!
//! A request is one JSON document terminated by [`ALL_END`]:
//!
//! ```text
//! {"time": "...", "data": [{"type": "command", "data": "ls server -l"},
//!                          {"type": "token", "data": "sess_..."}]}\x04
//! ```
//!
//! The reply uses the same envelope with `string`, `error`, `table` and
//! `token` items and the same terminator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::OutputItem;
use crate::error::{AdminError, Result};

/// End-of-message marker.
pub const ALL_END: u8 = 0x04;

/// Largest request accepted from a client.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Item type carrying the command line.
pub const ITEM_COMMAND: &str = "command";

/// Item type carrying a session token.
pub const ITEM_TOKEN: &str = "token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub time: Value,
    pub data: Vec<RequestItem>,
}

impl Request {
    /// The first `command` item, if it carries a string.
    pub fn command(&self) -> Option<&str> {
        self.data
            .iter()
            .find(|item| item.kind == ITEM_COMMAND)
            .and_then(|item| item.data.as_str())
    }

    /// The first `token` item, if any.
    pub fn token(&self) -> Option<&str> {
        self.data
            .iter()
            .find(|item| item.kind == ITEM_TOKEN)
            .and_then(|item| item.data.as_str())
    }
}

/// One reply item as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyItem {
    String { data: String },
    Error { data: String },
    Table { rows: Vec<Vec<String>> },
    Token { data: String },
}

impl From<OutputItem> for ReplyItem {
    fn from(item: OutputItem) -> Self {
        match item {
            OutputItem::Line(data) => ReplyItem::String { data },
            OutputItem::Error(data) => ReplyItem::Error { data },
            OutputItem::Table(table) => ReplyItem::Table {
                rows: table.into_rows(),
            },
            OutputItem::Token(data) => ReplyItem::Token { data },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub time: String,
    pub data: Vec<ReplyItem>,
}

impl Reply {
    pub fn errors(&self) -> Vec<&str> {
        self.data
            .iter()
            .filter_map(|item| match item {
                ReplyItem::Error { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn lines(&self) -> Vec<&str> {
        self.data
            .iter()
            .filter_map(|item| match item {
                ReplyItem::String { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Session token handed out by a login command.
    pub fn token(&self) -> Option<&str> {
        self.data.iter().find_map(|item| match item {
            ReplyItem::Token { data } => Some(data.as_str()),
            _ => None,
        })
    }
}

/// Decode a raw request.
///
/// The whole buffer must be a JSON object with a `data` array whose items
/// all carry a `type`.
pub fn parse_request(raw: &[u8]) -> Result<Request> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| AdminError::Protocol("request is not UTF-8".into()))?
        .trim();
    serde_json::from_str(text)
        .map_err(|e| AdminError::Protocol(format!("malformed request: {}", e)))
}

/// Build a request for `command`, optionally carrying a session token.
pub fn encode_request(command: &str, token: Option<&str>) -> Result<Vec<u8>> {
    let mut data = vec![RequestItem {
        kind: ITEM_COMMAND.to_string(),
        data: Value::String(command.to_string()),
    }];
    if let Some(token) = token {
        data.push(RequestItem {
            kind: ITEM_TOKEN.to_string(),
            data: Value::String(token.to_string()),
        });
    }
    let request = Request {
        time: Value::String(Utc::now().to_rfc3339()),
        data,
    };
    let mut bytes = serde_json::to_vec(&request)?;
    bytes.push(ALL_END);
    Ok(bytes)
}

/// Serialize reply items, terminator included.
pub fn encode_reply(items: &[ReplyItem]) -> serde_json::Result<Vec<u8>> {
    let reply = Reply {
        time: Utc::now().to_rfc3339(),
        data: items.to_vec(),
    };
    let mut bytes = serde_json::to_vec(&reply)?;
    bytes.push(ALL_END);
    Ok(bytes)
}

/// Decode a reply, ignoring a trailing terminator.
pub fn decode_reply(raw: &[u8]) -> Result<Reply> {
    let body = match raw.last() {
        Some(&ALL_END) => &raw[..raw.len() - 1],
        _ => raw,
    };
    Ok(serde_json::from_slice(body)?)
}

/// Read one message: everything up to [`ALL_END`] or EOF.
///
/// The terminator is not included in the result.
pub async fn read_message<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Some(pos) = chunk[..n].iter().position(|b| *b == ALL_END) {
            message.extend_from_slice(&chunk[..pos]);
            break;
        }
        message.extend_from_slice(&chunk[..n]);
        if message.len() > limit {
            return Err(AdminError::Protocol(format!(
                "request exceeds {} bytes",
                limit
            )));
        }
    }
    if message.len() > limit {
        return Err(AdminError::Protocol(format!("request exceeds {} bytes", limit)));
    }
    Ok(message)
}

/// Send one command over `stream` and wait for the reply.
pub async fn exchange<S>(stream: &mut S, command: &str, token: Option<&str>) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_request(command, token)?).await?;
    stream.flush().await?;
    let raw = read_message(stream, usize::MAX).await?;
    decode_reply(&raw)
}
