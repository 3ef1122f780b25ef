//! List the root directory

use super::{build_pipeline, mount};
use crate::error::CliError;
use dragflash_core::config::toml::BoardFile;
use dragflash_core::vfs::FileAttr;
use dragflash_core::SyncState;

fn attr_flags(attr: FileAttr) -> String {
    [
        (FileAttr::READ_ONLY, 'r'),
        (FileAttr::HIDDEN, 'h'),
        (FileAttr::SYSTEM, 's'),
        (FileAttr::ARCHIVE, 'a'),
    ]
    .iter()
    .map(|&(flag, c)| if attr.contains(flag) { c } else { '-' })
    .collect()
}

/// Run the ls command
pub fn run_ls(file: BoardFile) -> Result<(), CliError> {
    let sync = SyncState::new();
    let mut pipeline = build_pipeline(&file, &sync)?;
    let host = mount(&mut pipeline)?;

    match host.label() {
        Some(label) => println!("Volume {}", label),
        None => println!("Volume has no label"),
    }
    let total = host.mbr().total_sectors() as u64 * u64::from(host.mbr().bytes_per_sector.get());
    println!("{} MiB, FAT16", total / (1024 * 1024));
    println!();

    let mut count = 0;
    for entry in host.entries() {
        let attr = entry.attr();
        if attr.contains(FileAttr::VOLUME_LABEL) {
            continue;
        }
        println!(
            "{}  {:>10}  {}",
            attr_flags(attr),
            entry.size(),
            entry.filename
        );
        count += 1;
    }
    println!();
    println!("{} file(s)", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_flags() {
        assert_eq!(attr_flags(FileAttr::READ_ONLY | FileAttr::ARCHIVE), "r--a");
        assert_eq!(attr_flags(FileAttr::empty()), "----");
    }
}
