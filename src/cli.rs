use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "distexp")]
#[command(about = "Distributed experiment driver and remote agent", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve drivers: run their commands and stream output back
    Agent {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:20000")]
        listen: String,

        /// Directory for commands that do not set one (default: home)
        #[arg(short, long, value_name = "DIR")]
        working_dir: Option<PathBuf>,
    },

    /// Run `hostname` on every server of an inventory
    Ping {
        /// YAML inventory of servers
        #[arg(short, long, value_name = "FILE")]
        inventory: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let cli = Cli::try_parse_from(["distexp", "agent"]).unwrap();
        match cli.command {
            Command::Agent {
                listen,
                working_dir,
            } => {
                assert_eq!(listen, "0.0.0.0:20000");
                assert!(working_dir.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_agent_flags() {
        let cli = Cli::try_parse_from([
            "distexp",
            "agent",
            "--listen",
            "127.0.0.1:20005",
            "-w",
            "/scratch",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Agent { ref listen, working_dir: Some(_) } if listen == "127.0.0.1:20005"
        ));
    }

    #[test]
    fn test_ping_requires_inventory() {
        assert!(Cli::try_parse_from(["distexp", "ping"]).is_err());
        assert!(Cli::try_parse_from(["distexp", "ping", "-i", "servers.yaml"]).is_ok());
    }
}
