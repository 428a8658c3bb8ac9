use crate::disk::SECTOR_SIZE;

use super::{u16_at, u32_at, NtfsError};

/// Magic of an MFT file record.
pub const FILE_MAGIC: &[u8; 4] = b"FILE";

/// Verify and undo the update sequence array of a multi-sector record.
///
/// On disk, the last word of every 512-byte sector of the record has been
/// displaced by the checksum word stored at the head of the array. Each
/// displaced word must equal that checksum before it is put back from the
/// array. A mismatch is tolerated only when every sector not yet repaired
/// lies entirely beyond the record's `BytesInUse`; such sectors may hold
/// stale data from an earlier, larger record.
pub fn apply_fixup(record: &mut [u8]) -> Result<(), NtfsError> {
    if record.len() < 0x30 {
        return Err(NtfsError::Parse("record too small for a fixup header".into()));
    }
    if &record[0..4] != FILE_MAGIC {
        return Err(NtfsError::Parse("record lacks FILE magic".into()));
    }

    let usa_offset = u16_at(record, 0x04) as usize;
    let usa_count = u16_at(record, 0x06) as usize;
    let bytes_in_use = u32_at(record, 0x18) as usize;
    let bytes_allocated = u32_at(record, 0x1C) as usize;

    let sectors = usa_count.saturating_sub(1);
    if bytes_allocated < sectors * SECTOR_SIZE {
        return Err(NtfsError::InvalidData(
            "update sequence covers more than the allocated record".into(),
        ));
    }
    if sectors * SECTOR_SIZE > record.len() || usa_offset + usa_count * 2 > record.len() {
        return Err(NtfsError::InvalidData(
            "update sequence array out of range".into(),
        ));
    }

    let checksum = u16_at(record, usa_offset);
    let mut repaired = 0usize;
    for i in 0..sectors {
        let end = (i + 1) * SECTOR_SIZE;
        if u16_at(record, end - 2) != checksum {
            if repaired <= bytes_in_use {
                return Err(NtfsError::InvalidData(format!(
                    "update sequence mismatch in sector {i}"
                )));
            }
            break;
        }
        let replacement = usa_offset + (i + 1) * 2;
        record[end - 2] = record[replacement];
        record[end - 1] = record[replacement + 1];
        repaired += SECTOR_SIZE;
    }
    Ok(())
}
