//! NTFS volume parsing: boot block, `$MFT` bootstrap (including a
//! fragmented `$MFT` scattered across records via an `$ATTRIBUTE_LIST`),
//! and record-level access for the tree scan and file reads built on top.

pub mod attr;
pub mod boot;
pub mod compress;
pub mod datarun;
pub mod file;
pub mod fixup;
pub mod tree;

use std::fmt;

use log::debug;

use crate::disk::{DiskRead, PartitionView, SECTOR_SIZE};
use crate::error::DiskError;

use attr::{AttrBody, Attribute, ATTR_ATTRIBUTE_LIST, ATTR_DATA};
use boot::BootBlock;
use datarun::DataRun;

pub use file::NtfsFile;
pub use tree::Tree;

/// The low 48 bits of an MFT reference select the record; the upper 16 hold
/// the sequence number.
pub const MFT_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// MFT index of the root directory.
pub const MFT_INDEX_ROOT: u64 = 5;

/// First MFT index past the reserved system records.
pub const MFT_INDEX_FIRST_USER: u64 = 16;

/// FILE record flag: record is in use.
pub const FILE_FLAG_IN_USE: u16 = 0x0001;
/// FILE record flag: record describes a directory.
pub const FILE_FLAG_DIRECTORY: u16 = 0x0002;

/// Errors from the NTFS layers.
#[derive(Debug)]
pub enum NtfsError {
    Io(std::io::Error),
    Disk(DiskError),
    Parse(String),
    Unsupported(String),
    NotFound(String),
    InvalidData(String),
}

impl fmt::Display for NtfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NtfsError::Io(e) => write!(f, "I/O error: {e}"),
            NtfsError::Disk(e) => write!(f, "disk error: {e}"),
            NtfsError::Parse(msg) => write!(f, "parse error: {msg}"),
            NtfsError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            NtfsError::NotFound(msg) => write!(f, "not found: {msg}"),
            NtfsError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for NtfsError {}

impl From<std::io::Error> for NtfsError {
    fn from(e: std::io::Error) -> Self {
        NtfsError::Io(e)
    }
}

impl From<DiskError> for NtfsError {
    fn from(e: DiskError) -> Self {
        NtfsError::Disk(e)
    }
}

pub(crate) fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// One NTFS volume inside a partition of `disk`.
pub struct Ntfs<D: DiskRead> {
    view: PartitionView<D>,
    boot: BootBlock,
    bytes_per_record: u32,
    mft_run: DataRun,
    mft_size: u64,
}

impl<D: DiskRead> Ntfs<D> {
    /// Parse the boot block of the partition starting at `base_lba` and
    /// bootstrap the `$MFT` run list so records can be read by index.
    pub fn open(disk: D, base_lba: u64) -> Result<Self, NtfsError> {
        let mut view = PartitionView::new(disk, base_lba);
        let mut sector = [0u8; SECTOR_SIZE];
        view.read_sector(0, &mut sector)?;
        let boot = BootBlock::parse(&sector)?;

        let bytes_per_record = boot.bytes_per_file_record();
        if bytes_per_record == 0 || bytes_per_record % boot.bytes_per_sector as u32 != 0 {
            return Err(NtfsError::Parse(format!(
                "file record size {bytes_per_record} is not a multiple of the sector size"
            )));
        }

        let mut ntfs = Self {
            view,
            boot,
            bytes_per_record,
            mft_run: DataRun::new(),
            mft_size: 0,
        };
        ntfs.bootstrap_mft()?;
        debug!(
            "NTFS volume at LBA {base_lba}: cluster {} bytes, record {} bytes, $MFT {} bytes",
            ntfs.boot.cluster_size(),
            ntfs.bytes_per_record,
            ntfs.mft_size
        );
        Ok(ntfs)
    }

    pub fn boot(&self) -> &BootBlock {
        &self.boot
    }

    pub fn bytes_per_file_record(&self) -> u32 {
        self.bytes_per_record
    }

    pub fn cluster_size(&self) -> u32 {
        self.boot.cluster_size()
    }

    pub fn mft_size(&self) -> u64 {
        self.mft_size
    }

    /// Read `count` clusters starting at `lcn` into `buf`.
    pub fn read_lcn(&mut self, lcn: u64, count: u32, buf: &mut [u8]) -> Result<(), NtfsError> {
        let spc = self.boot.sectors_per_cluster as u32;
        self.view.read_sectors(lcn * spc as u64, count * spc, buf)?;
        Ok(())
    }

    /// Read and fix up the MFT record `index` (masked to 48 bits) into
    /// `record`, which must be one file record long.
    ///
    /// Returns `Ok(false)` when the slot does not hold a usable record:
    /// wrong magic or a failed update-sequence check. Callers scanning the
    /// MFT skip those; callers that require the record treat false as fatal.
    pub fn read_file_record(&mut self, index: u64, record: &mut [u8]) -> Result<bool, NtfsError> {
        if self.mft_run.is_empty() {
            return Err(NtfsError::InvalidData(
                "record requested before the $MFT run list was built".into(),
            ));
        }
        let index = index & MFT_MASK;
        let bps = self.boot.bytes_per_sector as u64;
        let spc = self.boot.sectors_per_cluster as u64;

        // a record can be smaller than a cluster; read the whole cluster
        // group that holds it and slice the right slot out
        let mut clusters = self.boot.clusters_per_file_record as u32;
        if clusters & 0x80 != 0 {
            clusters = 1;
        }
        let vcn = index * self.bytes_per_record as u64 / bps / spc;
        let lcn = self.mft_run.vcn_to_lcn(vcn)?;

        let mut group = vec![0u8; (bps * spc) as usize * clusters as usize];
        self.read_lcn(lcn, clusters, &mut group)?;

        let per_cluster = bps * spc / self.bytes_per_record as u64;
        let slot = index & per_cluster.saturating_sub(1);
        let start = (slot * self.bytes_per_record as u64) as usize;
        record.copy_from_slice(&group[start..start + self.bytes_per_record as usize]);

        if &record[0..4] != fixup::FILE_MAGIC {
            return Ok(false);
        }
        Ok(fixup::apply_fixup(record).is_ok())
    }

    /// Read `$MFT`'s own record and assemble its full run list. When an
    /// `$ATTRIBUTE_LIST` is present the `$MFT` data is itself fragmented:
    /// every referenced record contributes a further `$DATA` chunk, appended
    /// at the VCN the list entry names.
    fn bootstrap_mft(&mut self) -> Result<(), NtfsError> {
        let start_sector = self.boot.mft_start_lcn * self.boot.sectors_per_cluster as u64;
        let mut record = vec![0u8; self.bytes_per_record as usize];
        self.view.read_sectors(
            start_sector,
            self.bytes_per_record / SECTOR_SIZE as u32,
            &mut record,
        )?;
        fixup::apply_fixup(&mut record)?;
        if u16_at(&record, 0x16) & FILE_FLAG_IN_USE == 0 {
            return Err(NtfsError::InvalidData("$MFT record not in use".into()));
        }

        let attributes = attr::parse_attributes(&record)?;
        let mut data_attr: Option<&Attribute> = None;
        let mut list_attr: Option<&Attribute> = None;
        for attribute in &attributes {
            match attribute.attr_type {
                ATTR_DATA => {
                    if data_attr.replace(attribute).is_some() {
                        return Err(NtfsError::InvalidData(
                            "$MFT carries two $DATA attributes".into(),
                        ));
                    }
                }
                ATTR_ATTRIBUTE_LIST => {
                    if list_attr.replace(attribute).is_some() {
                        return Err(NtfsError::InvalidData(
                            "$MFT carries two $ATTRIBUTE_LIST attributes".into(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let data = data_attr
            .ok_or_else(|| NtfsError::InvalidData("$MFT has no $DATA attribute".into()))?;
        let AttrBody::NonResident {
            start_vcn,
            real_size,
            run_bytes,
            ..
        } = &data.body
        else {
            return Err(NtfsError::InvalidData(
                "$MFT $DATA is stored resident".into(),
            ));
        };
        self.mft_size = *real_size;
        let mut mft_run = DataRun::new();
        mft_run.init(run_bytes, *start_vcn)?;

        let list_entries = match list_attr {
            None => Vec::new(),
            Some(list) => {
                let AttrBody::Resident { value } = &list.body else {
                    return Err(NtfsError::Unsupported(
                        "non-resident $MFT attribute list".into(),
                    ));
                };
                attr::parse_attr_list(value)?
            }
        };

        self.mft_run = mft_run;
        let mut buf = vec![0u8; self.bytes_per_record as usize];
        for entry in list_entries {
            if entry.file_ref & MFT_MASK == 0 {
                continue; // the base record, decoded above
            }
            if !self.read_file_record(entry.file_ref, &mut buf)? {
                continue;
            }
            if u16_at(&buf, 0x16) & FILE_FLAG_IN_USE == 0 {
                continue;
            }
            for attribute in attr::parse_attributes(&buf)? {
                if attribute.attr_type != ATTR_DATA
                    || attribute.attr_id != entry.attr_id
                    || attribute.attr_type != entry.attr_type
                {
                    continue;
                }
                let AttrBody::NonResident {
                    start_vcn,
                    run_bytes,
                    ..
                } = &attribute.body
                else {
                    return Err(NtfsError::InvalidData(
                        "fragmented $MFT chunk is stored resident".into(),
                    ));
                };
                self.mft_run.append(run_bytes, *start_vcn)?;
            }
        }

        Ok(())
    }

    /// Direct access to the `$MFT` cluster map, for diagnostics and tests.
    pub fn mft_run(&self) -> &DataRun {
        &self.mft_run
    }
}
