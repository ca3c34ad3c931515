//! Unified error handling for skirmishd.
//!
//! User errors carry a message the player sees in red; they are never logged
//! above debug level. Operational errors are logged and absorbed at the
//! boundary that owns the failing resource.

use skirmish_proto::colors;
use thiserror::Error;

/// Errors surfaced to the player who caused them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command")]
    Unknown,
    #[error("{0}")]
    Usage(String),
    #[error("too soon since last server create")]
    CreateCooldown,
    #[error("failed to find server or space matching {0}")]
    NoSuchReference(String),
    #[error("you are already there")]
    AlreadyThere,
    #[error("duel type '{0}' does not exist")]
    NoSuchDuelFormat(String),
    #[error("you must be logged in to do that")]
    NotLoggedIn,
    #[error("command timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// The red chat line shown to the invoking player.
    pub fn user_message(&self) -> String {
        colors::red(&format!("command failed: {self}"))
    }
}

/// Errors from attaching a session to a server.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("server is not healthy")]
    NotHealthy,
    #[error("server never confirmed the connection")]
    Unconfirmed,
    #[error("session is no longer connected")]
    SessionGone,
}

/// Errors from spawning or starting a child server.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to find port in range")]
    PortsExhausted,
    #[error("failed to derive a unique server id")]
    IdCollision,
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
    #[error("preset '{0}' cannot be instantiated directly")]
    VirtualPreset(String),
    #[error("no default preset configured")]
    NoDefaultPreset,
    #[error("alias '{0}' is already in use")]
    AliasTaken(String),
    #[error("starting server timed out")]
    StartTimeout,
    #[error("server failed before becoming healthy")]
    FailedEarly,
    #[error("spawn io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_are_red() {
        let msg = CommandError::CreateCooldown.user_message();
        assert!(msg.starts_with('\u{c}'));
        assert!(msg.contains("too soon since last server create"));
    }
}
