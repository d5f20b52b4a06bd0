use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A control-surface command exited unsuccessfully. `output` is the
    /// combined stdout/stderr so the failure can be reproduced by hand.
    #[error("`{command}` failed: {output}")]
    Command { command: String, output: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A peer answered with something other than 200.
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("no available address in {0}")]
    NoAvailableAddress(ipnet::Ipv4Net),

    #[error("interface name {0} exceeds 15 bytes")]
    InterfaceNameTooLong(String),

    #[error("no MAC address found for {device}: {output}")]
    MacNotFound { device: String, output: String },

    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("node {0} not found in topology")]
    NodeNotFound(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("failed to parse topology: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to decode response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}
