use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Runs commands on the local host.
#[derive(Debug, Default, Clone)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));
        let out = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", program, args.join(" ")),
                source,
            })?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(if out.status.success() {
            CommandOutput::ok(output)
        } else {
            CommandOutput::failed(output)
        })
    }
}
