//! The built-in cluster command set.

use crate::commands::{Command, CommandRegistry, Role};
use crate::error::CommandError;
use std::sync::Arc;

/// Game mode names, in wire order.
pub const MODE_NAMES: &[&str] = &[
    "ffa",
    "coop",
    "teamplay",
    "insta",
    "instateam",
    "effic",
    "efficteam",
    "tac",
    "tacteam",
    "capture",
    "regencapture",
    "ctf",
    "instactf",
    "protect",
    "instaprotect",
    "hold",
    "instahold",
    "efficctf",
    "efficprotect",
    "effichold",
    "collect",
    "instacollect",
    "efficcollect",
];

pub fn mode_number(name: &str) -> Option<i32> {
    MODE_NAMES
        .iter()
        .position(|&mode| mode == name)
        .map(|index| index as i32)
}

pub fn register_cluster_commands(registry: &mut CommandRegistry) {
    let commands = vec![
        Command {
            name: "creategame",
            aliases: &[],
            arg_format: "[coop|ffa|insta|ctf|..etc] [map]",
            description: "create a private game for you and your friends",
            required_role: Role::Anyone,
            handler: Arc::new(|cluster, session, args| {
                Box::pin(async move { cluster.create_game(&session, &args).await })
            }),
        },
        Command {
            name: "join",
            aliases: &["go"],
            arg_format: "[name|id|alias]",
            description: "move to a space, server, or map by name, id, or alias",
            required_role: Role::Anyone,
            handler: Arc::new(|cluster, session, args| {
                Box::pin(async move {
                    let target = args
                        .first()
                        .ok_or_else(|| CommandError::Usage("join takes a target".into()))?;
                    cluster.go_to(&session, target).await
                })
            }),
        },
        Command {
            name: "duel",
            aliases: &["queue"],
            arg_format: "[ffa|insta]",
            description: "queue for 1v1 matchmaking",
            required_role: Role::Anyone,
            handler: Arc::new(|cluster, session, args| {
                Box::pin(async move {
                    let format = args.first().map(String::as_str).unwrap_or("");
                    cluster.matchmaker.queue(&session, format).await
                })
            }),
        },
        Command {
            name: "stopduel",
            aliases: &["leavequeue"],
            arg_format: "",
            description: "unqueue from 1v1 matchmaking",
            required_role: Role::Anyone,
            handler: Arc::new(|cluster, session, _| {
                Box::pin(async move {
                    cluster.matchmaker.dequeue(&session).await;
                    session.message("you left the duel queue").await;
                    Ok(())
                })
            }),
        },
        Command {
            name: "home",
            aliases: &[],
            arg_format: "",
            description: "go to your home space (also available via #go home)",
            required_role: Role::LoggedIn,
            handler: Arc::new(|cluster, session, _| {
                Box::pin(async move { cluster.go_home(&session).await })
            }),
        },
        Command {
            name: "edit",
            aliases: &[],
            arg_format: "",
            description: "toggle whether other players may edit your space",
            required_role: Role::LoggedIn,
            handler: Arc::new(|cluster, session, _| {
                Box::pin(async move { cluster.toggle_edit(&session).await })
            }),
        },
    ];

    for command in commands {
        registry
            .register(command)
            .expect("builtin command names are unique");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_map_to_wire_numbers() {
        assert_eq!(mode_number("ffa"), Some(0));
        assert_eq!(mode_number("insta"), Some(3));
        assert_eq!(mode_number("efficcollect"), Some(22));
        assert_eq!(mode_number("bogus"), None);
    }

    #[test]
    fn builtins_register_cleanly() {
        let mut registry = CommandRegistry::new();
        register_cluster_commands(&mut registry);
        for name in [
            "creategame",
            "join",
            "go",
            "duel",
            "queue",
            "stopduel",
            "home",
            "edit",
        ] {
            assert!(registry.resolve(name).is_some(), "missing {name}");
        }
    }
}
