use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::disk::SECTOR_SIZE;
use crate::error::DiskError;

/// "KDMV", little-endian, at the start of every sparse extent file.
pub const SPARSE_MAGIC: u32 = 0x564D_444B;

/// On-disk header of a SPARSE extent (512 bytes, little-endian, packed).
///
/// All offsets (`descriptor_offset`, `gd_offset`, grain directory and grain
/// table entries) are in sectors within the extent file.
#[derive(Debug, Clone)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    #[allow(dead_code)]
    pub rgd_offset: u64,
    pub gd_offset: u64,
    #[allow(dead_code)]
    pub overhead: u64,
    #[allow(dead_code)]
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Parse the header from the first sector of a sparse extent file.
    pub fn parse(data: &[u8]) -> Result<Self, DiskError> {
        if data.len() < SECTOR_SIZE {
            return Err(DiskError::InvalidDescriptor(
                "sparse extent header shorter than one sector".into(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != SPARSE_MAGIC {
            return Err(DiskError::InvalidDescriptor(format!(
                "bad sparse extent magic: expected {SPARSE_MAGIC:#010X}, got {magic:#010X}"
            )));
        }

        let version = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let capacity = cursor.read_u64::<LittleEndian>()?;
        let grain_size = cursor.read_u64::<LittleEndian>()?;
        let descriptor_offset = cursor.read_u64::<LittleEndian>()?;
        let descriptor_size = cursor.read_u64::<LittleEndian>()?;
        let num_gtes_per_gt = cursor.read_u32::<LittleEndian>()?;
        let rgd_offset = cursor.read_u64::<LittleEndian>()?;
        let gd_offset = cursor.read_u64::<LittleEndian>()?;
        let overhead = cursor.read_u64::<LittleEndian>()?;
        let _unclean_shutdown = cursor.read_u8()?;
        // single/non/double end-line detection characters
        cursor.seek(SeekFrom::Current(4))?;
        let compress_algorithm = cursor.read_u16::<LittleEndian>()?;

        if grain_size == 0 || num_gtes_per_gt == 0 {
            return Err(DiskError::InvalidDescriptor(
                "sparse extent header has zero grain geometry".into(),
            ));
        }

        Ok(Self {
            version,
            flags,
            capacity,
            grain_size,
            descriptor_offset,
            descriptor_size,
            num_gtes_per_gt,
            rgd_offset,
            gd_offset,
            overhead,
            compress_algorithm,
        })
    }

    /// Sectors covered by one grain table.
    pub fn gt_coverage(&self) -> u64 {
        self.num_gtes_per_gt as u64 * self.grain_size
    }
}

/// Backing layout of one extent.
#[derive(Debug)]
enum ExtentKind {
    Flat,
    Sparse(SparseExtentHeader),
}

/// One backing file of a VMDK disk.
///
/// FLAT extents map sector `n` to byte offset `n * 512`. SPARSE extents
/// resolve through the grain directory and grain tables; a zero entry at
/// either level means the sector is unallocated in this extent.
#[derive(Debug)]
pub struct Extent {
    sectors: u64,
    kind: ExtentKind,
    file: File,
    /// FLAT start offset from the extent line. Retained from the descriptor
    /// but not consulted for reads.
    #[allow(dead_code)]
    flat_offset: u64,
}

impl Extent {
    /// Open an extent's backing file. `type_name` is the TYPE field of the
    /// descriptor's extent line; only FLAT and SPARSE are supported.
    pub fn open(
        path: &Path,
        sectors: u64,
        type_name: &str,
        flat_offset: u64,
    ) -> Result<Self, DiskError> {
        let mut file = File::open(path).map_err(|e| {
            DiskError::InvalidDescriptor(format!("cannot open extent {}: {e}", path.display()))
        })?;

        let kind = match type_name {
            "FLAT" => ExtentKind::Flat,
            "SPARSE" => {
                let mut header = [0u8; SECTOR_SIZE];
                file.read_exact(&mut header)?;
                let seh = SparseExtentHeader::parse(&header)?;
                if seh.capacity != sectors {
                    return Err(DiskError::InvalidDescriptor(format!(
                        "extent {} advertises {} sectors but its header holds {}",
                        path.display(),
                        sectors,
                        seh.capacity
                    )));
                }
                ExtentKind::Sparse(seh)
            }
            other => {
                return Err(DiskError::UnsupportedExtent(format!(
                    "extent type {other} is not supported"
                )))
            }
        };

        Ok(Self {
            sectors,
            kind,
            file,
            flat_offset,
        })
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Read the extent-relative sector `sector` into `buf`.
    ///
    /// Returns `Ok(false)` when the sector is unallocated in this extent
    /// (sparse grain directory or grain table entry of zero); the caller
    /// decides whether to consult a parent disk or zero-fill.
    pub fn raw_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<bool, DiskError> {
        let (coverage, grain_size, gd_offset) = match &self.kind {
            ExtentKind::Flat => {
                self.file
                    .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
                self.file.read_exact(buf)?;
                return Ok(true);
            }
            ExtentKind::Sparse(seh) => (seh.gt_coverage(), seh.grain_size, seh.gd_offset),
        };

        let gde_index = sector / coverage;
        let gde = self.read_u32_at(gd_offset * SECTOR_SIZE as u64 + 4 * gde_index)?;
        if gde == 0 {
            return Ok(false);
        }

        let gte_index = (sector % coverage) / grain_size;
        let gte = self.read_u32_at(gde as u64 * SECTOR_SIZE as u64 + 4 * gte_index)?;
        if gte == 0 {
            return Ok(false);
        }

        let pos = gte as u64 * SECTOR_SIZE as u64 + (sector % grain_size) * SECTOR_SIZE as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(true)
    }

    fn read_u32_at(&mut self, pos: u64) -> Result<u32, DiskError> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(self.file.read_u32::<LittleEndian>()?)
    }
}
