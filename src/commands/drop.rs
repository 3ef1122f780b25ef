//! Copy a firmware file onto the drive and report the outcome

use super::{build_pipeline, mount, parse_name, read_file, settle};
use crate::error::CliError;
use dragflash_core::config::toml::BoardFile;
use dragflash_core::host::{SectorDevice, WriteOrder};
use dragflash_core::vfs::{Filename, SECTOR_SIZE};
use dragflash_core::SyncState;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

const FAIL_FILE: Filename = Filename::new(*b"FAIL    TXT");

/// Forwards sector I/O and advances a progress bar on data writes
struct ProgressDevice<'a, D> {
    inner: D,
    data_start: u32,
    pb: &'a ProgressBar,
}

impl<D: SectorDevice> SectorDevice for ProgressDevice<'_, D> {
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) {
        self.inner.read_sectors(sector, buf)
    }

    fn write_sectors(&mut self, sector: u32, buf: &[u8]) {
        self.inner.write_sectors(sector, buf);
        if sector >= self.data_start {
            self.pb.inc(buf.len() as u64);
        }
    }
}

/// Run the drop command
pub fn run_drop(
    file: BoardFile,
    path: &Path,
    name: Option<&str>,
    order: WriteOrder,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let data = std::fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let name = match name {
        Some(name) => parse_name(name)?,
        None => parse_name(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default(),
        )?,
    };

    let sync = SyncState::new();
    let mut pipeline = build_pipeline(&file, &sync)?;
    let data_start = pipeline.filesystem().mbr().data_start();

    println!(
        "Copying {} ({} bytes) to {}...",
        name,
        data.len(),
        file.board.drive_name.trim_end()
    );

    let total = (data.len() as u64).div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64;
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    {
        let dev = ProgressDevice {
            inner: &mut pipeline,
            data_start,
            pb: &pb,
        };
        let mut host = mount(dev)?;
        host.create_file(name, &data, order)?;
    }
    pb.finish_and_clear();

    log::debug!("Transfer phase after copy: {:?}", pipeline.transfer().phase);
    let settled = settle(&mut pipeline, file.timings.tick)?;
    log::info!("Drive reappeared after {} ms", settled.elapsed_ms);

    let target = pipeline.target();
    println!(
        "Target flash: {} bytes programmed, {} operations",
        target.used().len(),
        target.ops().len()
    );

    if let Some(out) = output {
        std::fs::write(out, target.data()).map_err(|source| CliError::Io {
            path: out.to_path_buf(),
            source,
        })?;
        println!("Saved target flash to {}", out.display());
    }

    if pipeline.take_reset_request() {
        println!("HIC requested a reset");
    }

    match settled.status {
        Ok(()) => {
            println!("Transfer complete");
            Ok(())
        }
        Err(e) => {
            let mut host = mount(&mut pipeline)?;
            if let Ok(text) = read_file(&mut host, &FAIL_FILE) {
                println!("{}:", FAIL_FILE);
                print!("{}", String::from_utf8_lossy(&text));
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::load_board;

    fn temp_file(name: &str, data: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dragflash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn image(len: usize) -> Vec<u8> {
        let mut data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        data[..4].copy_from_slice(&0x2000_4000u32.to_le_bytes());
        for i in 1..4 {
            data[i * 4..i * 4 + 4].copy_from_slice(&0x101u32.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_drop_bin_writes_output() {
        let data = image(0x3000);
        let input = temp_file("FIRM.BIN", &data);
        let output = input.with_file_name("firm.out");

        let file = load_board(None, false).unwrap();
        run_drop(file, &input, None, WriteOrder::DataFirst, Some(&output)).unwrap();

        let flash = std::fs::read(&output).unwrap();
        assert_eq!(&flash[..data.len()], &data[..]);
        let _ = std::fs::remove_file(input);
        let _ = std::fs::remove_file(output);
    }

    #[test]
    fn test_drop_directory_first() {
        let data = image(0x2400);
        let input = temp_file("dirfirst.img", &data);
        let output = input.with_file_name("dirfirst.out");

        let file = load_board(None, false).unwrap();
        run_drop(file, &input, Some("FIRM.BIN"), WriteOrder::DirectoryFirst, Some(&output))
            .unwrap();

        let flash = std::fs::read(&output).unwrap();
        assert_eq!(&flash[..data.len()], &data[..]);
        assert!(flash[data.len()..].iter().all(|&b| b == 0xFF));
        let _ = std::fs::remove_file(input);
        let _ = std::fs::remove_file(output);
    }

    #[test]
    fn test_drop_rejects_bad_name() {
        let input = temp_file("name.img", &[0; 16]);
        let file = load_board(None, false).unwrap();
        let err = run_drop(file, &input, Some("bad*name.bin"), WriteOrder::DataFirst, None)
            .unwrap_err();
        assert!(matches!(err, CliError::InvalidName(_)));
        let _ = std::fs::remove_file(input);
    }
}
