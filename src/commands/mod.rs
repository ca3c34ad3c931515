//! The command router.
//!
//! Chat lines starting with `#` are commands. Commands are registered with
//! a name, aliases, a typed argument format string, a description, and a
//! required role; dispatch resolves exact names first, then aliases, then
//! falls back to help. Handlers run under a ten-second timeout bound to the
//! session scope, and every failure becomes a red message to the invoking
//! player only.

mod cluster_commands;

pub use cluster_commands::{mode_number, register_cluster_commands, MODE_NAMES};

use crate::cluster::Cluster;
use crate::error::CommandError;
use crate::session::Session;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Handler execution bound.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Who may run a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Anyone,
    LoggedIn,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send>>;
pub type Handler =
    Arc<dyn Fn(Arc<Cluster>, Arc<Session>, Vec<String>) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub struct Command {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub arg_format: &'static str,
    pub description: &'static str,
    pub required_role: Role,
    pub handler: Handler,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("command '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<Command>,
    by_name: HashMap<&'static str, usize>,
    by_alias: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Command) -> Result<(), RegisterError> {
        if self.by_name.contains_key(command.name) || self.by_alias.contains_key(command.name) {
            return Err(RegisterError::Duplicate(command.name.to_string()));
        }
        for alias in command.aliases {
            if self.by_name.contains_key(alias) || self.by_alias.contains_key(alias) {
                return Err(RegisterError::Duplicate(alias.to_string()));
            }
        }

        let index = self.commands.len();
        self.by_name.insert(command.name, index);
        for alias in command.aliases {
            self.by_alias.insert(alias, index);
        }
        self.commands.push(command);
        Ok(())
    }

    /// Exact name first, then alias.
    pub fn resolve(&self, name: &str) -> Option<&Command> {
        self.by_name
            .get(name)
            .or_else(|| self.by_alias.get(name))
            .map(|&index| &self.commands[index])
    }

    /// One help line per command.
    pub fn help(&self) -> Vec<String> {
        self.commands.iter().map(help_line).collect()
    }

    pub fn help_for(&self, name: &str) -> Option<String> {
        self.resolve(name).map(help_line)
    }

    /// Tokenize and run one command line (without the `#` sentinel).
    pub async fn dispatch(
        &self,
        cluster: Arc<Cluster>,
        session: Arc<Session>,
        input: &str,
    ) -> Result<(), CommandError> {
        let mut args: Vec<String> = input.split_whitespace().map(String::from).collect();
        if args.is_empty() {
            return Err(CommandError::Unknown);
        }
        let name = args.remove(0);

        if name == "help" || name == "?" {
            return self.run_help(&session, &args).await;
        }

        let command = self.resolve(&name).ok_or(CommandError::Unknown)?;
        if command.required_role == Role::LoggedIn && !session.is_logged_in() {
            return Err(CommandError::NotLoggedIn);
        }

        (command.handler)(cluster, session, args).await
    }

    async fn run_help(
        &self,
        session: &Arc<Session>,
        args: &[String],
    ) -> Result<(), CommandError> {
        match args.first() {
            None => {
                session.message("available commands:").await;
                for line in self.help() {
                    session.raw_message(&line).await;
                }
                Ok(())
            }
            Some(name) => match self.help_for(name) {
                Some(line) => {
                    session.raw_message(&line).await;
                    Ok(())
                }
                None => Err(CommandError::Failed(format!(
                    "could not find help for '{name}'"
                ))),
            },
        }
    }
}

fn help_line(command: &Command) -> String {
    let mut line = format!("#{}", command.name);
    if !command.arg_format.is_empty() {
        line.push(' ');
        line.push_str(command.arg_format);
    }
    line.push_str(" - ");
    line.push_str(command.description);
    if !command.aliases.is_empty() {
        line.push_str(&format!(" (also: {})", command.aliases.join(", ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(name: &'static str, aliases: &'static [&'static str]) -> Command {
        Command {
            name,
            aliases,
            arg_format: "[target]",
            description: "does a thing",
            required_role: Role::Anyone,
            handler: Arc::new(|_, _, _| Box::pin(async { Ok(()) })),
        }
    }

    #[test]
    fn resolves_names_before_aliases() {
        let mut registry = CommandRegistry::new();
        registry.register(stub("join", &["go"])).unwrap();
        registry.register(stub("gob", &[])).unwrap();

        assert_eq!(registry.resolve("join").unwrap().name, "join");
        assert_eq!(registry.resolve("go").unwrap().name, "join");
        assert_eq!(registry.resolve("gob").unwrap().name, "gob");
        assert!(registry.resolve("leave").is_none());
    }

    #[test]
    fn duplicate_names_and_aliases_are_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(stub("duel", &["queue"])).unwrap();
        assert_eq!(
            registry.register(stub("duel", &[])),
            Err(RegisterError::Duplicate("duel".into()))
        );
        assert_eq!(
            registry.register(stub("queue", &[])),
            Err(RegisterError::Duplicate("queue".into()))
        );
        assert_eq!(
            registry.register(stub("other", &["duel"])),
            Err(RegisterError::Duplicate("duel".into()))
        );
    }

    #[test]
    fn help_lines_carry_format_and_aliases() {
        let mut registry = CommandRegistry::new();
        registry.register(stub("join", &["go"])).unwrap();
        let help = registry.help();
        assert_eq!(help.len(), 1);
        assert_eq!(help[0], "#join [target] - does a thing (also: go)");
        assert_eq!(registry.help_for("go").as_deref(), Some(help[0].as_str()));
    }
}
