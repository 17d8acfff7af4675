use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rfio::cli::AgentOpts;
use rfio::config::Config;
use rfio::StandardPage;

fn main() -> Result<()> {
    let opts = AgentOpts::parse();
    let config = Config::load_or_default(opts.config.as_deref())?;
    rfio::logger::init(opts.verbose, &config.logging)?;

    match opts.listen.as_deref() {
        Some(addr) => {
            let addr = if addr == "config" {
                config.agent.listen_addr.as_str()
            } else {
                addr
            };
            if addr.starts_with("0.0.0.0") {
                tracing::warn!(
                    "binding to {} exposes the agent to every interface; the protocol has no authentication",
                    addr
                );
            }
            rfio::agent::listen(addr, Arc::new(StandardPage))
        }
        None => {
            let summary = rfio::communicate_stdio().context("agent conversation failed")?;
            info!(
                requests = summary.requests,
                released = summary.released,
                "agent finished"
            );
            Ok(())
        }
    }
}
