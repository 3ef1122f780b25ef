//! dragflash - A drag-and-drop firmware update simulator
//!
//! Runs the HIC side of a DAPLink-style mass-storage update on the host:
//! a virtual FAT16 drive backed by in-memory target and HIC flashes. A
//! simulated operating system copies files onto the drive sector by sector,
//! and the pipeline decodes and programs them exactly as the HIC would.
//!
//! # Architecture
//!
//! - `dragflash-core` holds the pipeline, the virtual drive and the
//!   host-side FAT writer
//! - `dragflash-dummy` provides the in-memory flashes
//! - the commands here wire them together and report what happened

mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let board = commands::load_board(cli.board.as_deref(), cli.bootloader)?;

    let result = match cli.command {
        Commands::Drop {
            file,
            name,
            order,
            output,
        } => commands::drop::run_drop(
            board,
            &file,
            name.as_deref(),
            order.into(),
            output.as_deref(),
        ),
        Commands::Ls => commands::ls::run_ls(board),
        Commands::Cat { name } => commands::cat::run_cat(board, &name),
        Commands::Magic { name } => commands::magic::run_magic(board, &name),
    };

    result.map_err(Into::into)
}
