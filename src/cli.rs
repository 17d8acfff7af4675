//! Shared CLI helpers and small reusable Clap fragments

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;

use crate::channel::Connection;
use crate::config::Config;
use crate::fio::Fio;
use crate::location::Location;

/// Options of the `rfio-agent` executor
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "rfio agent: executes file requests sent by an rfio client")]
pub struct AgentOpts {
    /// Serve one conversation over stdin/stdout (the default, for ssh)
    #[arg(long, conflicts_with = "listen")]
    pub stdio: bool,

    /// Listen for TCP connections on host:port ("config" uses [agent] listen_addr)
    #[arg(long, value_name = "ADDR", num_args = 0..=1, default_missing_value = "config")]
    pub listen: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// How the client reaches its agent
#[derive(Clone, Debug, clap::Args)]
pub struct ConnectOpts {
    /// Agent TCP address (host:port)
    #[arg(long, conflicts_with = "agent_cmd")]
    pub connect: Option<String>,

    /// Command that starts an agent speaking on its stdin/stdout,
    /// e.g. "ssh db01 rfio-agent --stdio"
    #[arg(long)]
    pub agent_cmd: Option<String>,

    /// Location of this process; the agent serves every other one
    #[arg(long, value_enum, default_value_t = Location::BackupHost)]
    pub here: Location,
}

impl ConnectOpts {
    /// Build the execution context. Without an agent every location runs
    /// locally.
    pub fn context(&self, config: &Config) -> Result<Fio> {
        let connect = self.connect.as_ref().or(config.agent.connect.as_ref());
        let command = self.agent_cmd.as_ref().or(config.agent.command.as_ref());
        let conn = match (connect, command) {
            (Some(addr), _) => Connection::tcp(addr)?,
            (None, Some(cmd)) => Connection::spawn(&mut split_command(cmd)?)?,
            (None, None) => return Ok(Fio::new(self.here)),
        };
        Ok(Fio::connected(self.here, conn))
    }
}

fn split_command(cmd: &str) -> Result<Command> {
    let mut words = cmd.split_whitespace();
    let program = words.next().context("empty agent command")?;
    let mut command = Command::new(program);
    command.args(words);
    Ok(command)
}

/// Parse an octal permission string such as "700" or "0o644".
pub fn parse_octal(s: &str) -> std::result::Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode {:?}: {}", s, e))
}
