//! Command-line surface: `sbc server` snapshots the running process into an
//! image; `sbc client` loads one or more images and calls into them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// sbc - in-process subcontext demo
#[derive(Parser)]
#[command(name = "sbc", version, about = "In-process subcontext snapshot/load demo")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Snapshot this process's own address space into an image file.
    Server {
        /// Image output path (also: SBC_IMAGE env var)
        #[arg(long, env = "SBC_IMAGE")]
        output: PathBuf,
    },
    /// Load one or more images and call their exported functions in order.
    Client {
        /// Image file paths, loaded and called in sequence
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_server_subcommand() {
        let cli = Cli::parse_from(["sbc", "server", "--output", "/tmp/out.img"]);
        match cli.command {
            Commands::Server { output } => assert_eq!(output, PathBuf::from("/tmp/out.img")),
            _ => panic!("expected Server"),
        }
    }

    #[test]
    fn parses_client_subcommand_with_multiple_images() {
        let cli = Cli::parse_from(["sbc", "client", "a.img", "b.img"]);
        match cli.command {
            Commands::Client { images } => {
                assert_eq!(images, vec![PathBuf::from("a.img"), PathBuf::from("b.img")]);
            }
            _ => panic!("expected Client"),
        }
    }
}
