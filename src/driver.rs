//! End-to-end operations over a VMDK: the per-partition snapshot listing
//! (with raw MBR and boot sector dumps) and single-file extraction.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;

use crate::disk::{DiskRead, SECTOR_SIZE};
use crate::error::DiskError;
use crate::ntfs::{Ntfs, NtfsFile, Tree, MFT_INDEX_ROOT};
use crate::partition::read_partition_table;
use crate::vmdk::VmdkDisk;

/// Path extracted by [`dump`] when none is given.
pub const DEFAULT_DUMP_PATH: &str = "/WINDOWS/system32/notepad.exe";

/// Output file of [`dump`] when none is given.
pub const DEFAULT_DUMP_OUT: &str = "dump.bin";

/// Write the directory listing of every NTFS partition to `out`, or to
/// stdout when no output path is given.
///
/// With an output path, sector 0 is also dumped beside it as
/// `<out>.mbr.bin`, and every partition's first sector as `<out>.bootN.bin`
/// (NTFS or not); listings are produced only for NTFS partitions, lettered
/// `C:` onward in partition order.
pub fn snapshot(descriptor: &Path, out: Option<&Path>) -> Result<()> {
    let mut disk = VmdkDisk::open(descriptor)?;
    let partitions = read_partition_table(&mut disk)?;
    info!(
        "{}: {} sectors, {} partitions",
        descriptor.display(),
        disk.total_sectors(),
        partitions.len()
    );

    let mut listing: Box<dyn Write> = match out {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("cannot create listing file {}", path.display())
        })?)),
        None => Box::new(std::io::stdout().lock()),
    };

    if let Some(path) = out {
        let mut sector = [0u8; SECTOR_SIZE];
        disk.raw_sector(0, &mut sector)?;
        write_sector_dump(&sibling(path, ".mbr.bin"), &sector)?;
    }

    for (ordinal, partition) in partitions.iter().enumerate() {
        if let Some(path) = out {
            let mut sector = [0u8; SECTOR_SIZE];
            disk.raw_sector(partition.first_lba, &mut sector)?;
            write_sector_dump(&sibling(path, &format!(".boot{ordinal}.bin")), &sector)?;
        }

        if !partition.is_ntfs() {
            continue;
        }
        let drive = drive_letter(ordinal)?;
        info!(
            "partition {ordinal}: NTFS at LBA {}, listing as {drive}:",
            partition.first_lba
        );

        let mut ntfs = Ntfs::open(&mut disk, partition.first_lba)?;
        let tree = Tree::build(&mut ntfs)?;
        tree.write_listing(&format!("{drive}:"), &mut listing, MFT_INDEX_ROOT)?;
    }

    listing.flush()?;
    Ok(())
}

/// Extract the stream named by `inner_path` from partition
/// `partition_index` into the file at `out`.
pub fn dump(descriptor: &Path, partition_index: usize, inner_path: &str, out: &Path) -> Result<()> {
    let mut disk = VmdkDisk::open(descriptor)?;
    let partitions = read_partition_table(&mut disk)?;
    let partition = partitions
        .get(partition_index)
        .ok_or(DiskError::PartitionOutOfRange {
            requested: partition_index,
            available: partitions.len(),
        })?;

    let mut ntfs = Ntfs::open(&mut disk, partition.first_lba)?;
    let tree = Tree::build(&mut ntfs)?;
    let mut file = NtfsFile::open(&mut ntfs, &tree, inner_path)?;

    let mut writer = BufWriter::new(
        File::create(out).with_context(|| format!("cannot create {}", out.display()))?,
    );
    let mut buf = [0u8; SECTOR_SIZE];
    let mut total = 0u64;
    while !file.eof() {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;

    info!(
        "extracted {total} of {} bytes from {inner_path} into {}",
        file.size(),
        out.display()
    );
    Ok(())
}

/// Partition ordinals map to drive letters starting at `C`.
fn drive_letter(ordinal: usize) -> Result<char> {
    let letter = b'C' as usize + ordinal;
    if letter > b'Z' as usize {
        bail!("partition {ordinal} is past drive letter Z");
    }
    Ok(letter as u8 as char)
}

/// `<out>.mbr.bin`-style names append to the full output path.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_sector_dump(path: &Path, sector: &[u8]) -> Result<()> {
    std::fs::write(path, sector).with_context(|| format!("cannot write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_letters_run_c_to_z() {
        assert_eq!(drive_letter(0).unwrap(), 'C');
        assert_eq!(drive_letter(23).unwrap(), 'Z');
        assert!(drive_letter(24).is_err());
    }

    #[test]
    fn test_sibling_appends_to_full_name() {
        assert_eq!(
            sibling(Path::new("/tmp/listing.txt"), ".mbr.bin"),
            PathBuf::from("/tmp/listing.txt.mbr.bin")
        );
        assert_eq!(
            sibling(Path::new("out"), ".boot2.bin"),
            PathBuf::from("out.boot2.bin")
        );
    }
}
