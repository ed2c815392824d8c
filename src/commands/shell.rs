// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Read-only shell commands on the server or a connected client.
//!
//! Every command takes a target (`server` or a client name) as its first
//! argument. Options are checked against a `clap` definition of the tool
//! and file arguments are confined to relative, plain paths. The validated
//! command line is stored on the connection during authorization and run
//! by the handler without a shell.

use std::path::{Path, PathBuf};
use std::io::Read;
use std::process::{Command as Process, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::{Arg, ArgAction, ColorChoice, Command};
use regex::Regex;
use serde_json::Value;

use crate::conn::Connection;
use crate::error::{AdminError, Result};
use crate::registry::{Action, AuthzContext, AuthzOutcome, CommandModule, CommandSpec, ModuleSpec};

pub const SHELL_SCOPE: &str = "sys";

/// Target name that runs the command locally.
pub const SERVER_TARGET: &str = "server";

/// Connection extra holding the validated argv.
pub const SHELL_CMD_PROP: &str = "shell_cmd";

const TEXT_EXTENSIONS: &[&str] = &[".txt", ".log", ".json", ".csv", ".sh", ".config", ".py"];

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a running server-side command is checked for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Forwards shell commands to federated clients.
pub trait ClientRelay: Send + Sync {
    /// Whether `client` names a known, connected client.
    fn is_valid_client(&self, client: &str) -> bool;

    /// Run `argv` on `client`; `None` when no reply arrived within `timeout`.
    fn run_shell_command(&self, client: &str, argv: &[String], timeout: Duration) -> Option<String>;
}

// =============================================================================
// VALIDATION
// =============================================================================

/// How file arguments of a tool are checked.
#[derive(Debug, Clone, Copy)]
struct FileRules {
    required: bool,
    single: bool,
    text_only: bool,
}

#[derive(Debug, Clone, Copy)]
enum ToolKind {
    NoArgs,
    Files(FileRules),
}

#[derive(Debug, Clone, Copy)]
struct Tool {
    name: &'static str,
    description: &'static str,
    usage: &'static str,
    kind: ToolKind,
}

const FILE_TOOL: FileRules = FileRules {
    required: true,
    single: true,
    text_only: true,
};

const TOOLS: &[Tool] = &[
    Tool {
        name: "pwd",
        description: "print the name of work directory",
        usage: "pwd target",
        kind: ToolKind::NoArgs,
    },
    Tool {
        name: "ls",
        description: "list files in work dir",
        usage: "ls target [options] [files]",
        kind: ToolKind::Files(FileRules {
            required: false,
            single: false,
            text_only: false,
        }),
    },
    Tool {
        name: "cat",
        description: "show content of a file",
        usage: "cat target [options] fileName",
        kind: ToolKind::Files(FILE_TOOL),
    },
    Tool {
        name: "head",
        description: "print the first 10 lines of a file",
        usage: "head target [options] fileName",
        kind: ToolKind::Files(FILE_TOOL),
    },
    Tool {
        name: "tail",
        description: "print the last 10 lines of a file",
        usage: "tail target [options] fileName",
        kind: ToolKind::Files(FILE_TOOL),
    },
    Tool {
        name: "grep",
        description: "search for PATTERN in a file.",
        usage: "grep target [options] PATTERN fileName",
        kind: ToolKind::Files(FILE_TOOL),
    },
    Tool {
        name: "env",
        description: "show system environment vars",
        usage: "env target",
        kind: ToolKind::NoArgs,
    },
];

fn flag(id: &'static str, short: char, help: &'static str) -> Arg {
    Arg::new(id).short(short).help(help).action(ArgAction::SetTrue)
}

fn count(id: &'static str, short: char, help: &'static str) -> Arg {
    Arg::new(id)
        .short(short)
        .help(help)
        .value_parser(clap::value_parser!(i64))
        .action(ArgAction::Set)
}

fn files(required: bool, multiple: bool) -> Arg {
    let arg = Arg::new("files").value_name("file").required(required);
    if multiple {
        arg.num_args(1..)
    } else {
        arg
    }
}

/// Option grammar of a tool, or `None` for tools that take no arguments.
fn arg_parser(tool: &'static str) -> Option<Command> {
    let cmd = Command::new(tool)
        .no_binary_name(true)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .color(ColorChoice::Never);

    let cmd = match tool {
        "ls" => cmd
            .arg(flag("all", 'a', "do not ignore entries starting with ."))
            .arg(flag("long", 'l', "use a long listing format"))
            .arg(flag("time", 't', "sort by modification time, newest first"))
            .arg(flag("size", 'S', "sort by file size, largest first"))
            .arg(flag("recursive", 'R', "list subdirectories recursively"))
            .arg(flag("access", 'u', "with -l: show access time, otherwise: sort by access time"))
            .arg(files(false, false)),
        "cat" => cmd
            .arg(flag("number", 'n', "number all output lines"))
            .arg(flag("number-nonblank", 'b', "number nonempty output lines, overrides -n"))
            .arg(flag("squeeze", 's', "suppress repeated empty output lines"))
            .arg(flag("show-tabs", 'T', "display TAB characters as ^I"))
            .arg(files(true, true)),
        "head" => cmd
            .arg(count("bytes", 'c', "print the first C bytes of each file"))
            .arg(count("lines", 'n', "print the first N lines instead of the first 10"))
            .arg(files(true, true)),
        "tail" => cmd
            .arg(count("bytes", 'c', "output the last C bytes"))
            .arg(count("lines", 'n', "output the last N lines"))
            .arg(files(true, true)),
        "grep" => cmd
            .arg(flag("line-number", 'n', "print line number with output lines"))
            .arg(flag("ignore-case", 'i', "ignore case distinctions"))
            .arg(flag("byte-offset", 'b', "print the byte offset with output lines"))
            .arg(Arg::new("pattern").value_name("pattern").required(true))
            .arg(files(true, true)),
        _ => return None,
    };
    Some(cmd)
}

fn safe_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]*$").expect("file name regex is valid"))
}

fn check_file(file: &str, text_only: bool) -> std::result::Result<(), String> {
    if !safe_file_pattern().is_match(file) {
        return Err(format!("unsupported file {}", file));
    }
    if file.starts_with('/') {
        return Err("absolute path is not allowed".to_string());
    }
    if file.split('/').any(|part| part == "..") {
        return Err(".. in path name is not allowed".to_string());
    }
    if text_only {
        let ext = Path::new(file)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Err(format!(
                "this command cannot be applied to file {}. Only files with the following \
                 extensions are permitted: {}",
                file,
                TEXT_EXTENSIONS.join(", ")
            ));
        }
    }
    Ok(())
}

/// Validate `tool_args` (everything after the target) for `tool`.
///
/// Returns the argv to execute.
fn validate(tool: &Tool, tool_args: &[String]) -> std::result::Result<Vec<String>, String> {
    let rules = match tool.kind {
        ToolKind::NoArgs => {
            if !tool_args.is_empty() {
                return Err("this command does not accept extra args".to_string());
            }
            return Ok(vec![tool.name.to_string()]);
        }
        ToolKind::Files(rules) => rules,
    };

    let parser = arg_parser(tool.name).ok_or_else(|| format!("unsupported command {}", tool.name))?;
    let matches = parser.try_get_matches_from(tool_args).map_err(|e| {
        let rendered = e.to_string();
        rendered.lines().next().unwrap_or("invalid arguments").trim().to_string()
    })?;

    let file_args: Vec<&String> = matches
        .get_many::<String>("files")
        .map(|values| values.collect())
        .unwrap_or_default();
    if rules.required && file_args.is_empty() {
        return Err("a file is required as an argument".to_string());
    }
    if rules.single && file_args.len() > 1 {
        return Err("only one file is allowed".to_string());
    }
    for file in file_args {
        check_file(file, rules.text_only)?;
    }

    let mut argv = Vec::with_capacity(tool_args.len() + 1);
    argv.push(tool.name.to_string());
    argv.extend(tool_args.iter().cloned());
    Ok(argv)
}

fn full_usage(tool: &Tool) -> String {
    let mut usage = format!("{}\nwhere target is \"server\" or client name", tool.usage);
    if let Some(mut parser) = arg_parser(tool.name) {
        usage.push('\n');
        usage.push_str(&parser.render_usage().to_string());
    }
    usage
}

// =============================================================================
// MODULE
// =============================================================================

/// The `sys` scope.
pub struct ShellModule {
    work_dir: Option<PathBuf>,
    relay: Option<Arc<dyn ClientRelay>>,
    command_timeout: Duration,
}

impl Default for ShellModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellModule {
    pub fn new() -> Self {
        Self {
            work_dir: None,
            relay: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Run server-side commands in `dir` instead of the process directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Bound on server-side commands and relayed client replies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn ClientRelay>, timeout: Duration) -> Self {
        self.relay = Some(relay);
        self.command_timeout = timeout;
        self
    }

    fn authorize(tool: &Tool, conn: &mut Connection, args: &[String]) -> AuthzOutcome {
        let Some(target) = args.get(1) else {
            return AuthzOutcome::Denied("syntax error: missing target".to_string());
        };

        match validate(tool, &args[2..]) {
            Ok(argv) => {
                conn.props.set_extra(SHELL_CMD_PROP, Value::from(argv));
                AuthzOutcome::Granted(Some(AuthzContext::new(vec![target.clone()], Action::View)))
            }
            Err(msg) => AuthzOutcome::Denied(msg),
        }
    }

    fn execute(&self, conn: &mut Connection) -> Result<()> {
        let Some(target) = conn
            .props
            .authz_ctx
            .as_ref()
            .and_then(|ctx| ctx.site_names.first().cloned())
        else {
            conn.append_error("program error: no authorization context");
            return Ok(());
        };

        let argv: Vec<String> = match conn.props.remove_extra(SHELL_CMD_PROP) {
            Some(value) => serde_json::from_value(value)?,
            None => {
                conn.append_error("program error: no validated command");
                return Ok(());
            }
        };

        if target == SERVER_TARGET {
            match self.run_local(&argv)? {
                Some(output) => conn.append_string(output),
                None => conn.append_error("command timed out"),
            }
            return Ok(());
        }

        let Some(relay) = self.relay.as_ref().filter(|r| r.is_valid_client(&target)) else {
            conn.append_error(format!("invalid client: {}", target));
            return Ok(());
        };
        match relay.run_shell_command(&target, &argv, self.command_timeout) {
            Some(reply) => conn.append_string(reply),
            None => conn.append_error("no reply from client - timed out"),
        }
        Ok(())
    }

    /// Run `argv` on the server. `None` means it was killed at the timeout.
    fn run_local(&self, argv: &[String]) -> Result<Option<String>> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| AdminError::handler("empty shell command"))?;
        let mut process = Process::new(program);
        process
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.work_dir {
            process.current_dir(dir);
        }

        tracing::debug!(command = %argv.join(" "), "running shell command");
        let mut child = process
            .spawn()
            .map_err(|e| AdminError::handler(format!("failed to run {}: {}", program, e)))?;

        // Pipes are drained on their own threads so a chatty child cannot stall.
        let stdout = child.stdout.take().map(drain_pipe);
        let stderr = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + self.command_timeout;
        while child.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    command = %argv.join(" "),
                    timeout = ?self.command_timeout,
                    "shell command timed out; killing it"
                );
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut text = String::new();
        for pipe in [stdout, stderr].into_iter().flatten() {
            let bytes = pipe.join().unwrap_or_default();
            text.push_str(&String::from_utf8_lossy(&bytes));
        }
        Ok(Some(text.trim_end_matches('\n').to_string()))
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        bytes
    })
}

impl CommandModule for ShellModule {
    fn spec(self: Arc<Self>) -> ModuleSpec {
        let commands = TOOLS
            .iter()
            .map(|tool| {
                let tool = *tool;
                let module = Arc::clone(&self);
                let handler = move |conn: &mut Connection, _: &[String]| module.execute(conn);
                CommandSpec::new(tool.name, tool.description, full_usage(&tool), handler)
                    .with_authz(move |conn, args| Self::authorize(&tool, conn, args))
            })
            .collect();
        ModuleSpec::new(SHELL_SCOPE, commands)
    }
}
