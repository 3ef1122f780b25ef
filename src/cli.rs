//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use dragflash_core::host::WriteOrder;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dragflash")]
#[command(author, version, about = "Drag-and-drop firmware update simulator", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Board file (TOML format); the built-in example board if not given
    #[arg(long, global = true)]
    pub board: Option<PathBuf>,

    /// Run as bootloader instead of interface firmware
    #[arg(long, global = true)]
    pub bootloader: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Sector order used when copying a file onto the drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Order {
    /// Data sectors in order, then FAT, then the directory entry
    #[default]
    Sequential,
    /// Empty directory entry first, the final entry last
    DirFirst,
    /// Sequential with the second and third data sectors swapped
    Swap,
}

impl From<Order> for WriteOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Sequential => WriteOrder::DataFirst,
            Order::DirFirst => WriteOrder::DirectoryFirst,
            Order::Swap => WriteOrder::Swap(1),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy a firmware file onto the virtual drive and program it
    Drop {
        /// BIN or HEX file to copy
        file: PathBuf,

        /// 8.3 name on the drive (defaults to the file's own name)
        #[arg(short, long)]
        name: Option<String>,

        /// Sector order of the simulated host
        #[arg(long, value_enum, default_value_t = Order::Sequential)]
        order: Order,

        /// Save the target flash contents afterwards
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the root directory of a freshly presented drive
    Ls,

    /// Print a file from the drive, e.g. DETAILS.TXT
    Cat {
        /// 8.3 name of the file
        name: String,
    },

    /// Create a magic file and show the resulting settings
    Magic {
        /// 8.3 name of the magic file, e.g. AUTO_OFF.CFG
        name: String,
    },
}
