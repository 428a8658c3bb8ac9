use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use log::debug;

use crate::disk::{DiskRead, SECTOR_SIZE};
use crate::error::DiskError;

const MBR_SIGNATURE: u16 = 0xAA55;
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;

/// Extended container whose first sector is an EBR.
const PART_TYPE_EXTENDED: u8 = 0x0F;

/// NTFS partition type byte.
pub const PART_TYPE_NTFS: u8 = 0x07;

/// Corrupted EBR chains are cut off after this many logical partitions.
const MAX_LOGICAL_PARTITIONS: usize = 64;

/// CHS (Cylinder-Head-Sector) address extracted from a partition entry.
#[derive(Debug, Clone, Copy)]
pub struct ChsAddress {
    pub head: u8,
    pub sector: u8,    // bits 0-5 only (6 bits)
    pub cylinder: u16, // 10 bits: 2 high bits from sector byte + 8 bits from cylinder byte
}

impl ChsAddress {
    fn parse(bytes: &[u8; 3]) -> Self {
        let head = bytes[0];
        let sector = bytes[1] & 0x3F;
        let cylinder = ((bytes[1] as u16 & 0xC0) << 2) | bytes[2] as u16;
        Self {
            head,
            sector,
            cylinder,
        }
    }
}

/// One 16-byte partition table entry as stored in an MBR or EBR.
#[derive(Debug, Clone)]
struct RawEntry {
    status: u8,
    partition_type: u8,
    chs_start: ChsAddress,
    first_lba: u32,
    sector_count: u32,
}

impl RawEntry {
    fn parse(data: &[u8; PARTITION_ENTRY_SIZE]) -> Self {
        let status = data[0];
        let chs_start = ChsAddress::parse(&[data[1], data[2], data[3]]);
        let partition_type = data[4];

        let mut cursor = Cursor::new(&data[8..16]);
        let first_lba = cursor.read_u32::<LittleEndian>().unwrap();
        let sector_count = cursor.read_u32::<LittleEndian>().unwrap();

        Self {
            status,
            partition_type,
            chs_start,
            first_lba,
            sector_count,
        }
    }
}

/// A partition with its absolute on-disk position. Logical partitions from
/// an EBR chain have already been rebased to whole-disk LBAs.
#[derive(Debug, Clone)]
pub struct Partition {
    pub partition_type: u8,
    pub status: u8,
    pub chs_start: ChsAddress,
    pub first_lba: u64,
    pub sector_count: u64,
}

impl Partition {
    fn from_entry(entry: &RawEntry, base_lba: u64) -> Self {
        Self {
            partition_type: entry.partition_type,
            status: entry.status,
            chs_start: entry.chs_start,
            first_lba: base_lba + entry.first_lba as u64,
            sector_count: entry.sector_count as u64,
        }
    }

    pub fn is_ntfs(&self) -> bool {
        self.partition_type == PART_TYPE_NTFS
    }
}

/// Read sector 0 as an MBR and walk any EBR chains.
///
/// The result lists primary data partitions (type other than 0x00 and 0x0F)
/// in slot order, followed by the logical partitions of each extended
/// container in chain order.
pub fn read_partition_table(disk: &mut impl DiskRead) -> Result<Vec<Partition>, DiskError> {
    let mut sector = [0u8; SECTOR_SIZE];
    disk.raw_sector(0, &mut sector)?;
    let entries = parse_table_sector(&sector, "MBR")?;

    let mut partitions = Vec::new();
    for entry in &entries {
        if entry.partition_type != 0 && entry.partition_type != PART_TYPE_EXTENDED {
            partitions.push(Partition::from_entry(entry, 0));
        }
    }
    for entry in &entries {
        if entry.partition_type == PART_TYPE_EXTENDED {
            walk_ebr_chain(disk, entry.first_lba as u64, &mut partitions)?;
        }
    }

    debug!("partition table holds {} partitions", partitions.len());
    Ok(partitions)
}

/// Validate the 0xAA55 signature and parse the four table entries.
fn parse_table_sector(sector: &[u8; SECTOR_SIZE], what: &str) -> Result<[RawEntry; 4], DiskError> {
    let mut cursor = Cursor::new(&sector[510..512]);
    let signature = cursor.read_u16::<LittleEndian>().unwrap();
    if signature != MBR_SIGNATURE {
        return Err(DiskError::InvalidPartitionTable(format!(
            "invalid {what} signature: expected 0xAA55, got {signature:#06X}"
        )));
    }

    Ok(std::array::from_fn(|i| {
        let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        let entry: [u8; PARTITION_ENTRY_SIZE] =
            sector[offset..offset + PARTITION_ENTRY_SIZE].try_into().unwrap();
        RawEntry::parse(&entry)
    }))
}

/// Walk the EBR chain rooted at `first_ebr_lba`.
///
/// Entry 0 of each EBR describes a logical partition whose start is relative
/// to that EBR's own sector; entry 1, when non-empty, points at the next EBR
/// relative to the current one.
fn walk_ebr_chain(
    disk: &mut impl DiskRead,
    first_ebr_lba: u64,
    partitions: &mut Vec<Partition>,
) -> Result<(), DiskError> {
    let mut ebr_lba = first_ebr_lba;

    loop {
        if partitions.len() > MAX_LOGICAL_PARTITIONS {
            debug!("EBR chain exceeds {MAX_LOGICAL_PARTITIONS} entries, stopping");
            break;
        }

        let mut sector = [0u8; SECTOR_SIZE];
        disk.raw_sector(ebr_lba, &mut sector)?;
        let entries = parse_table_sector(&sector, "EBR")?;

        partitions.push(Partition::from_entry(&entries[0], ebr_lba));

        let link = &entries[1];
        if link.first_lba == 0 || link.sector_count == 0 {
            break;
        }
        ebr_lba += link.first_lba as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RawDisk;
    use std::io::Cursor;

    fn put_entry(sector: &mut [u8], slot: usize, ptype: u8, first_lba: u32, count: u32) {
        let offset = PARTITION_TABLE_OFFSET + slot * PARTITION_ENTRY_SIZE;
        sector[offset] = 0x80;
        // CHS start: head 1, sector 1, cylinder 0
        sector[offset + 1] = 1;
        sector[offset + 2] = 1;
        sector[offset + 3] = 0;
        sector[offset + 4] = ptype;
        sector[offset + 8..offset + 12].copy_from_slice(&first_lba.to_le_bytes());
        sector[offset + 12..offset + 16].copy_from_slice(&count.to_le_bytes());
    }

    fn sign(sector: &mut [u8]) {
        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    fn disk_of(image: Vec<u8>) -> RawDisk<Cursor<Vec<u8>>> {
        RawDisk::new(Cursor::new(image))
    }

    #[test]
    fn test_single_primary_partition() {
        let mut image = vec![0u8; SECTOR_SIZE];
        put_entry(&mut image, 0, PART_TYPE_NTFS, 2048, 1048576);
        sign(&mut image);

        let partitions = read_partition_table(&mut disk_of(image)).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].first_lba, 2048);
        assert_eq!(partitions[0].sector_count, 1048576);
        assert!(partitions[0].is_ntfs());
        assert_eq!(partitions[0].status, 0x80);
        assert_eq!(partitions[0].chs_start.head, 1);
    }

    #[test]
    fn test_missing_signature_is_fatal() {
        let image = vec![0u8; SECTOR_SIZE];
        let err = read_partition_table(&mut disk_of(image)).unwrap_err();
        assert!(err.to_string().contains("0xAA55"));
    }

    #[test]
    fn test_primaries_kept_in_slot_order() {
        let mut image = vec![0u8; SECTOR_SIZE];
        put_entry(&mut image, 0, 0x07, 2048, 100);
        put_entry(&mut image, 2, 0x83, 4096, 200);
        sign(&mut image);

        let partitions = read_partition_table(&mut disk_of(image)).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].first_lba, 2048);
        assert_eq!(partitions[1].first_lba, 4096);
        assert!(!partitions[1].is_ntfs());
    }

    /// A two-link EBR chain: MBR primary at 2048, extended container
    /// at 4096 with a logical at +128 linking (relative +1024) to a second
    /// EBR holding a logical at +64.
    #[test]
    fn test_ebr_chain_absolute_rebasing() {
        let mut image = vec![0u8; SECTOR_SIZE * 6000];

        put_entry(&mut image[..512], 0, 0x07, 2048, 1000);
        put_entry(&mut image[..512], 1, 0x0F, 4096, 5000);
        sign(&mut image[..512]);

        {
            let ebr = &mut image[4096 * SECTOR_SIZE..4097 * SECTOR_SIZE];
            put_entry(ebr, 0, 0x07, 128, 500);
            put_entry(ebr, 1, 0x05, 1024, 4000);
            sign(ebr);
        }
        {
            let ebr = &mut image[5120 * SECTOR_SIZE..5121 * SECTOR_SIZE];
            put_entry(ebr, 0, 0x07, 64, 3000);
            sign(ebr);
        }

        let partitions = read_partition_table(&mut disk_of(image)).unwrap();
        assert_eq!(partitions.len(), 3);
        assert_eq!(
            (partitions[0].first_lba, partitions[0].sector_count),
            (2048, 1000)
        );
        assert_eq!(
            (partitions[1].first_lba, partitions[1].sector_count),
            (4224, 500)
        );
        assert_eq!(
            (partitions[2].first_lba, partitions[2].sector_count),
            (5184, 3000)
        );
    }

    #[test]
    fn test_ebr_bad_signature_is_fatal() {
        let mut image = vec![0u8; SECTOR_SIZE * 200];
        put_entry(&mut image[..512], 0, 0x0F, 100, 100);
        sign(&mut image[..512]);
        // EBR sector at LBA 100 left unsigned

        assert!(read_partition_table(&mut disk_of(image)).is_err());
    }

    #[test]
    fn test_ebr_zero_link_terminates_chain() {
        let mut image = vec![0u8; SECTOR_SIZE * 200];
        put_entry(&mut image[..512], 0, 0x0F, 100, 100);
        sign(&mut image[..512]);
        {
            let ebr = &mut image[100 * SECTOR_SIZE..101 * SECTOR_SIZE];
            put_entry(ebr, 0, 0x07, 1, 10);
            sign(ebr);
        }

        let partitions = read_partition_table(&mut disk_of(image)).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].first_lba, 101);
    }
}
