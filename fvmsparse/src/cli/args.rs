/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::cli::{fvm, sparse};

#[derive(Debug, Subcommand)]
pub enum Command {
    Info(sparse::InfoCli),
    Pack(sparse::PackCli),
    Unpack(sparse::UnpackCli),
    Decompress(sparse::DecompressCli),
    Fvm(fvm::FvmCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Don't print image metadata.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Lowest log level to show.
    ///
    /// The `RUST_LOG` environment variable can be used for more granular
    /// filtering.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t = Level::INFO)]
    pub log_level: Level,
}

/// Install the global tracing subscriber. Log messages are written to stderr so
/// that they don't mix with the metadata printed to stdout.
pub fn init_logging(level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Info(c) => sparse::info_subcommand(&c, cli.quiet),
        Command::Pack(c) => sparse::pack_subcommand(&c, cli.quiet),
        Command::Unpack(c) => sparse::unpack_subcommand(&c, cli.quiet, cancel_signal),
        Command::Decompress(c) => sparse::decompress_subcommand(&c, cancel_signal),
        Command::Fvm(c) => fvm::fvm_main(&c, cli.quiet),
    }
}
