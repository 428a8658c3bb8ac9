//! VMware VMDK disk parsing with whole-disk sector read capability.
//!
//! Supports monolithic and split FLAT and SPARSE disks, plus snapshot
//! chains: a descriptor carrying `parentFileNameHint` opens its parent disk
//! recursively, and sectors unallocated at this level fall through to it.

pub mod extent;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;

use crate::disk::{DiskRead, SECTOR_SIZE};
use crate::error::DiskError;
use extent::{Extent, SparseExtentHeader};

/// External descriptor files larger than this are rejected.
const MAX_DESCRIPTOR_BYTES: u64 = 1024 * 1024;

/// Snapshot chains deeper than this indicate a descriptor cycle.
const MAX_PARENT_DEPTH: u32 = 32;

/// One extent line from the descriptor's "# Extent description" section:
/// `ACCESS SECTORS TYPE "FILENAME" [OFFSET]`.
#[derive(Debug, Clone, PartialEq)]
struct ExtentLine {
    /// RW / RDONLY / NOACCESS; parsed but not consulted by a reader.
    #[allow(dead_code)]
    access: String,
    sectors: u64,
    type_name: String,
    filename: String,
    offset: u64,
}

/// A VMDK virtual disk: an ordered chain of extents plus an optional parent
/// snapshot, resolved from a descriptor file.
pub struct VmdkDisk {
    extents: Vec<Extent>,
    parent: Option<Box<VmdkDisk>>,
    properties: HashMap<String, String>,
    total_sectors: u64,
}

impl VmdkDisk {
    /// Open a disk from its descriptor file. The descriptor may be an
    /// external text file or embedded inside a sparse extent (the file then
    /// starts with the "KDMV" magic).
    pub fn open(descriptor: &Path) -> Result<Self, DiskError> {
        Self::open_at_depth(descriptor, 0)
    }

    fn open_at_depth(descriptor: &Path, depth: u32) -> Result<Self, DiskError> {
        if depth >= MAX_PARENT_DEPTH {
            return Err(DiskError::InvalidDescriptor(format!(
                "snapshot chain deeper than {MAX_PARENT_DEPTH} levels"
            )));
        }

        let text = read_descriptor_text(descriptor)?;
        let (properties, extent_lines) = parse_descriptor(&text)?;
        if extent_lines.is_empty() {
            return Err(DiskError::InvalidDescriptor(format!(
                "{} defines no extents",
                descriptor.display()
            )));
        }

        let base_dir = descriptor.parent().unwrap_or(Path::new(".")).to_path_buf();

        let mut extents = Vec::with_capacity(extent_lines.len());
        for line in &extent_lines {
            extents.push(Extent::open(
                &base_dir.join(&line.filename),
                line.sectors,
                &line.type_name,
                line.offset,
            )?);
        }

        let parent = match properties.get("parentFileNameHint") {
            Some(hint) => {
                let parent_path = resolve_relative(&base_dir, hint);
                debug!("following parent snapshot {}", parent_path.display());
                Some(Box::new(Self::open_at_depth(&parent_path, depth + 1)?))
            }
            None => None,
        };

        let total_sectors = extents.iter().map(Extent::sectors).sum();
        debug!(
            "opened {}: {} extents, {} sectors{}",
            descriptor.display(),
            extents.len(),
            total_sectors,
            if parent.is_some() { ", has parent" } else { "" }
        );

        Ok(Self {
            extents,
            parent,
            properties,
            total_sectors,
        })
    }

    /// Total sectors advertised by the extent chain.
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Descriptor properties (key/value lines from all text sections).
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

impl DiskRead for VmdkDisk {
    fn raw_sector(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        // locate the extent holding this sector
        let mut rel = lba;
        let mut index = 0;
        while index < self.extents.len() && rel >= self.extents[index].sectors() {
            rel -= self.extents[index].sectors();
            index += 1;
        }
        let extent = self
            .extents
            .get_mut(index)
            .ok_or(DiskError::SectorOutOfRange { lba })?;

        if extent.raw_sector(rel, buf)? {
            return Ok(());
        }

        // unallocated here: delegate to the parent snapshot with the
        // whole-disk sector number, or zero-fill when there is no parent
        match &mut self.parent {
            Some(parent) => parent.raw_sector(lba, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }
}

/// Load the descriptor text, whether embedded in a sparse header or stored
/// as a standalone text file.
fn read_descriptor_text(path: &Path) -> Result<String, DiskError> {
    let mut file = File::open(path).map_err(|e| {
        DiskError::InvalidDescriptor(format!("cannot open descriptor {}: {e}", path.display()))
    })?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(|e| {
        DiskError::InvalidDescriptor(format!("descriptor {} too short: {e}", path.display()))
    })?;
    file.seek(SeekFrom::Start(0))?;

    let mut buf;
    if &magic == b"KDMV" {
        let mut header = [0u8; SECTOR_SIZE];
        file.read_exact(&mut header)?;
        let seh = SparseExtentHeader::parse(&header)?;
        if seh.descriptor_offset == 0 {
            return Err(DiskError::InvalidDescriptor(
                "sparse extent carries no embedded descriptor".into(),
            ));
        }
        buf = vec![0u8; (seh.descriptor_size * SECTOR_SIZE as u64) as usize];
        file.seek(SeekFrom::Start(seh.descriptor_offset * SECTOR_SIZE as u64))?;
        file.read_exact(&mut buf)?;
    } else {
        let size = file.metadata()?.len();
        if size > MAX_DESCRIPTOR_BYTES {
            return Err(DiskError::InvalidDescriptor(format!(
                "descriptor {} is {size} bytes; the external form is limited to 1 MiB",
                path.display()
            )));
        }
        buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)?;
    }

    // the embedded descriptor region is zero-padded to whole sectors
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse the line-oriented descriptor grammar. Section transitions are
/// driven by the comment markers; key/value lines from the DescriptorFile,
/// Disk Data Base, and DDB sections all land in one properties map.
fn parse_descriptor(
    text: &str,
) -> Result<(HashMap<String, String>, Vec<ExtentLine>), DiskError> {
    let mut properties = HashMap::new();
    let mut extents = Vec::new();
    let mut state = 0; // 1=descriptor, 2=extents, 3=disk data, 4=ddb

    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if state == 3 && line.starts_with("#DDB") {
                state = 4;
            }
            if state == 2 && line.starts_with("# The Disk Data Base") {
                state = 3;
            }
            if state == 1 && line.starts_with("# Extent description") {
                state = 2;
            }
            if state == 0 && line.starts_with("# Disk DescriptorFile") {
                state = 1;
            }
            continue;
        }

        match state {
            1 | 3 | 4 => {
                if let Some(eq) = line.find('=') {
                    let key = line[..eq].trim();
                    let mut value = line[eq + 1..].trim();
                    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                        value = &value[1..value.len() - 1];
                    }
                    properties.insert(key.to_string(), value.to_string());
                }
            }
            2 => extents.push(parse_extent_line(line)?),
            _ => {}
        }
    }

    Ok((properties, extents))
}

fn parse_extent_line(line: &str) -> Result<ExtentLine, DiskError> {
    let bad = |what: &str| {
        DiskError::InvalidDescriptor(format!("extent line {what}: {line}"))
    };

    let quote = line.find('"').ok_or_else(|| bad("missing quoted file name"))?;
    let mut head = line[..quote].split_whitespace();
    let access = head.next().ok_or_else(|| bad("missing access mode"))?.to_string();
    let sectors = head
        .next()
        .ok_or_else(|| bad("missing sector count"))?
        .parse::<u64>()
        .map_err(|_| bad("has a malformed sector count"))?;
    let type_name = head.next().ok_or_else(|| bad("missing type"))?.to_string();

    let tail = &line[quote + 1..];
    let close = tail.find('"').ok_or_else(|| bad("has an unterminated file name"))?;
    let filename = tail[..close].to_string();

    let offset = match tail[close + 1..].split_whitespace().next() {
        Some(word) => word
            .parse::<u64>()
            .map_err(|_| bad("has a malformed offset"))?,
        None => 0,
    };

    Ok(ExtentLine {
        access,
        sectors,
        type_name,
        filename,
        offset,
    })
}

/// Resolve a descriptor-relative path the way VMware writes hints: relative
/// to the referencing descriptor's directory unless already absolute.
fn resolve_relative(base_dir: &Path, hint: &str) -> PathBuf {
    let hinted = Path::new(hint);
    if hinted.is_absolute() {
        hinted.to_path_buf()
    } else {
        base_dir.join(hinted)
    }
}
