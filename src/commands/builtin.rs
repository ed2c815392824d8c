// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Built-in commands: command listing and echo.

use std::sync::Arc;

use crate::conn::Connection;
use crate::error::Result;
use crate::registry::{CommandModule, CommandRegistry, CommandSpec, CommandTable, ModuleSpec};

/// Commands available on every registry, in the unnamed scope.
pub struct BuiltinModule {
    table: CommandTable,
}

impl BuiltinModule {
    pub fn new(table: CommandTable) -> Self {
        Self { table }
    }

    fn list_commands(&self, conn: &mut Connection, args: &[String]) {
        if args.len() <= 1 {
            let entries = self.table.visible_entries();
            let headers = ["Scope", "Command", "Description", "Usage", "Confirm"];
            let Some(table) = conn.append_table(&headers) else {
                return;
            };
            for e in entries {
                table.add_row([
                    e.scope.clone(),
                    e.name.clone(),
                    e.description.clone(),
                    e.usage.clone(),
                    e.confirm.to_string(),
                ]);
            }
            return;
        }

        for name in &args[1..] {
            self.show_command(conn, name);
        }
    }

    fn show_command(&self, conn: &mut Connection, name: &str) {
        let entries = self.table.get_command_entries(name);
        if entries.is_empty() {
            conn.append_error(format!("undefined command {}", name));
            return;
        }
        for e in entries {
            conn.append_string(format!("Command: {}", e.qualified_name()));
            conn.append_string(format!("Description: {}", e.description));
            conn.append_string(format!("Usage: {}", e.usage));
        }
    }
}

impl CommandModule for BuiltinModule {
    fn spec(self: Arc<Self>) -> ModuleSpec {
        let module = Arc::clone(&self);
        ModuleSpec::new(
            "",
            vec![
                CommandSpec::new(
                    "_commands",
                    "list server commands",
                    "_commands [command ...]",
                    move |conn, args| {
                        module.list_commands(conn, args);
                        Ok(())
                    },
                )
                .hidden(),
                CommandSpec::new(
                    "echo",
                    "echo user input back to client",
                    "echo args ...",
                    |conn, args| {
                        for arg in args {
                            conn.append_string(arg.clone());
                        }
                        Ok(())
                    },
                )
                .hidden(),
            ],
        )
    }
}

/// A registry with the built-in module already registered.
pub fn new_registry_with_builtins() -> Result<CommandRegistry> {
    let registry = CommandRegistry::new();
    registry.register_module(Arc::new(BuiltinModule::new(registry.table())))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AuthzOutcome;

    struct Ops;

    impl CommandModule for Ops {
        fn spec(self: Arc<Self>) -> ModuleSpec {
            ModuleSpec::new(
                "ops",
                vec![
                    CommandSpec::new("restart", "restart a site", "restart target", |_, _| Ok(()))
                        .confirm(),
                    CommandSpec::new("check", "check a site", "check target", |_, _| Ok(()))
                        .with_authz(|_, _| AuthzOutcome::Granted(None)),
                    CommandSpec::new("_secret", "hidden", "_secret", |_, _| Ok(())).hidden(),
                ],
            )
        }
    }

    fn registry() -> CommandRegistry {
        let registry = new_registry_with_builtins().unwrap();
        registry.register_module(Arc::new(Ops)).unwrap();
        registry.finalize().unwrap();
        registry
    }

    #[test]
    fn test_list_commands_table() {
        let registry = registry();
        let mut conn = Connection::detached();
        registry.process_command(&mut conn, "_commands").unwrap();

        let tables = conn.tables();
        assert_eq!(tables.len(), 1);
        let rows = tables[0].data_rows();
        let names: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(names, vec!["check", "restart"]);
        assert_eq!(rows[1][4], "true");
    }

    #[test]
    fn test_show_named_commands() {
        let registry = registry();
        let mut conn = Connection::detached();
        registry
            .process_command(&mut conn, "_commands restart nothing _secret")
            .unwrap();

        assert_eq!(
            conn.lines(),
            vec![
                "Command: ops.restart",
                "Description: restart a site",
                "Usage: restart target"
            ]
        );
        assert_eq!(
            conn.errors(),
            vec!["undefined command nothing", "undefined command _secret"]
        );
    }

    #[test]
    fn test_echo() {
        let registry = registry();
        let mut conn = Connection::detached();
        registry.process_command(&mut conn, r#"echo hello "big world""#).unwrap();
        assert_eq!(conn.lines(), vec!["echo", "hello", "big world"]);
    }
}
