use anyhow::{Context, Result};
use clap::Parser;
use sbc_core::config::{Cli, Commands};
use sbc_core::error::Error;
use sbc_core::{matchmaker, snapshotter};
use std::path::{Path, PathBuf};

/// Demo exported function: increments its argument. Address is recorded as
/// func_entries[0] by `sbc server`.
extern "C" fn demo_add_one(x: i32) -> i32 {
    x + 1
}

/// Demo exported function: returns its argument unchanged. func_entries[1].
extern "C" fn demo_identity(x: i32) -> i32 {
    x
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Server { output } => run_server(&output),
        Commands::Client { images } => run_client(&images),
    }
}

fn run_server(output: &Path) -> Result<()> {
    eprintln!("[sbc-server] snapshotting self to {}", output.display());
    let funcs = [demo_add_one as usize as u64, demo_identity as usize as u64];
    snapshotter::snapshot_self(output, &funcs).context("snapshot failed")?;
    eprintln!("[sbc-server] wrote {}", output.display());
    Ok(())
}

fn run_client(images: &[PathBuf]) -> Result<()> {
    matchmaker::init().context("matchmaker init failed")?;

    for path in images {
        eprintln!("[sbc-client] loading {}", path.display());
        let fd = matchmaker::request_map(path).with_context(|| format!("failed to map {}", path.display()))?;

        let mut index = 0usize;
        loop {
            match matchmaker::call(fd, index, 41) {
                Ok(result) => {
                    eprintln!("[sbc-client] {} call({}) -> {}", path.display(), index, result);
                    index += 1;
                }
                Err(Error::BadIndex { .. }) => break,
                Err(e) => return Err(e).with_context(|| format!("{} call({}) failed", path.display(), index)),
            }
        }

        matchmaker::request_unmap(fd).with_context(|| format!("failed to unmap {}", path.display()))?;
    }

    matchmaker::finalize().context("finalize failed")?;
    eprintln!("[sbc-client] done.");
    Ok(())
}
