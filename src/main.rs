//! distexp CLI entry point

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use distexp::agent::{default_working_dir, Agent};
use distexp::config::Inventory;
use distexp::core::{ReturnCode, RunOptions, Scheduler, Server};
use distexp::error::DriverResult;
use distexp::output::{lock, shared, Lines, Shared};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::debug!("distexp v{}", env!("CARGO_PKG_VERSION"));

    let scheduler = Scheduler::new()?;
    match cli.command {
        Command::Agent {
            listen,
            working_dir,
        } => scheduler.block_on(serve(&listen, working_dir)),
        Command::Ping { inventory } => scheduler.block_on(ping(&inventory)),
    }
}

async fn serve(listen: &str, working_dir: Option<PathBuf>) -> Result<()> {
    let working_dir = working_dir.unwrap_or_else(default_working_dir);
    let agent = Agent::bind(listen, working_dir)
        .await
        .with_context(|| format!("cannot listen on {}", listen))?;
    agent.serve().await?;
    Ok(())
}

async fn ping(inventory: &Path) -> Result<()> {
    let inventory = Inventory::from_file(inventory)?;
    let servers = inventory.server_list()?;

    let mut failed = 0;
    for server in &servers {
        let out = shared(Lines::new());
        match hostname(server, &out).await {
            Ok(ReturnCode::Exited(0)) => println!("{}: {}", server.id(), lock(&out).text().trim()),
            Ok(rc) => {
                failed += 1;
                println!("{}: hostname returned {}", server.id(), rc);
            }
            Err(e) => {
                failed += 1;
                println!("{}: {}", server.id(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} server(s) failed", failed, servers.len());
    }
    Ok(())
}

async fn hostname(server: &Server, out: &Shared<Lines>) -> DriverResult<ReturnCode> {
    let options = RunOptions::new()
        .stdout(out)
        .raise_on_rc(false)
        .timeout(PING_TIMEOUT);
    let cmd = server.run_cmd_with("hostname", options).await?;
    let rc = cmd.wait().await?;
    if rc == ReturnCode::Timeout {
        cmd.kill().await?;
    }
    Ok(rc)
}
