//! Default values for optional configuration fields.

use std::path::PathBuf;

pub fn web_path() -> String {
    "/service".to_string()
}

pub fn working_dir() -> PathBuf {
    std::env::temp_dir().join("skirmish")
}

pub fn min_port() -> u16 {
    50000
}

pub fn max_port() -> u16 {
    51000
}

pub fn socket_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn socket_prefix() -> String {
    "qserv".to_string()
}

pub fn warmup_seconds() -> u64 {
    30
}

pub fn phase_seconds() -> u64 {
    180
}
