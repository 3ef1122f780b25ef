//! Create a magic file and show what it changed

use super::{build_pipeline, mount, parse_name, read_file, settle};
use crate::error::CliError;
use dragflash_core::config::toml::BoardFile;
use dragflash_core::config::Settings;
use dragflash_core::host::WriteOrder;
use dragflash_core::vfs::{Filename, MagicFile};
use dragflash_core::SyncState;

const DETAILS_FILE: Filename = Filename::new(*b"DETAILS TXT");

fn print_settings(settings: &Settings) {
    let on_off = |b: bool| if b { "on" } else { "off" };
    println!("  Automation allowed:  {}", on_off(settings.automation_allowed));
    println!("  Auto reset:          {}", on_off(settings.auto_reset));
    println!("  Overflow detection:  {}", on_off(settings.overflow_detect));
    println!("  Page erasing:        {}", on_off(settings.page_erase));
    println!("  Drive disabled:      {}", on_off(settings.msd_disabled));
    println!("  Hold in bootloader:  {}", on_off(settings.hold_in_bootloader));
}

/// Run the magic command
pub fn run_magic(file: BoardFile, name: &str) -> Result<(), CliError> {
    let name = parse_name(name)?;
    match MagicFile::from_name(file.board.mode, &name) {
        Some(magic) => log::info!("{} is the {:?} magic file", name, magic),
        None => log::warn!("{} is not a magic file here, creating it anyway", name),
    }

    let sync = SyncState::new();
    let mut pipeline = build_pipeline(&file, &sync)?;
    mount(&mut pipeline)?.create_file(name, &[], WriteOrder::DataFirst)?;

    let settled = settle(&mut pipeline, file.timings.tick)?;
    log::info!("Drive reappeared after {} ms", settled.elapsed_ms);

    println!("Settings:");
    print_settings(pipeline.settings());
    if pipeline.take_reset_request() {
        println!("HIC requested a reset");
    }

    let mut host = mount(&mut pipeline)?;
    let details = read_file(&mut host, &DETAILS_FILE)?;
    println!();
    print!("{}", String::from_utf8_lossy(&details));
    Ok(())
}
