//! Command execution against the host's network configuration surface.
//!
//! The daemon never links against netlink directly; every change goes
//! through `ip`, `iptables` and `sysctl`. The [`CommandRunner`] trait is
//! the seam that lets the controllers run against a scripted fake.

use async_trait::async_trait;

use crate::error::Result;

pub mod host;
pub use host::HostRunner;

#[cfg(test)]
pub mod fake;

/// What a finished command reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// A command that ran but exited non-zero is `Ok` with `success ==
    /// false`; `Err` is reserved for failing to start it at all.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}
