//! Full-volume MFT scan: every in-use record becomes a [`Node`] carrying
//! its name(s) and data streams, grouped under its parent directory's MFT
//! index. The result answers directory lookups for path resolution and
//! renders the listing the snapshot command prints.

use std::collections::BTreeMap;
use std::io::Write;

use log::debug;

use crate::disk::DiskRead;

use super::attr::{self, AttrBody, Attribute, ATTR_ATTRIBUTE_LIST, ATTR_DATA, ATTR_FILE_NAME};
use super::datarun::DataRun;
use super::{
    u16_at, Ntfs, NtfsError, FILE_FLAG_DIRECTORY, FILE_FLAG_IN_USE, MFT_INDEX_FIRST_USER,
    MFT_INDEX_ROOT, MFT_MASK,
};

/// One named data stream of a file. The default stream has an empty name.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    pub name: Vec<u16>,
    pub resident: bool,
    pub real_size: u64,
    pub compressed: bool,
    /// Log2 of the clusters per compression unit (from the attribute).
    pub compression_unit: u16,
    pub compressed_size: u64,
    /// Inline value of a resident stream.
    pub data: Vec<u8>,
    /// Cluster map of a non-resident stream.
    pub run: DataRun,
}

/// A file or directory found during the MFT scan.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub mft_ref: u64,
    pub parent_ref: u64,
    pub file_attributes: u32,
    pub is_dir: bool,
    pub name: Vec<u16>,
    pub short_name: Vec<u16>,
    pub streams: BTreeMap<Vec<u16>, Stream>,
}

/// The folder graph of one NTFS volume.
pub struct Tree {
    /// Children of each directory, keyed by the directory's MFT index.
    folders: BTreeMap<u64, Vec<Node>>,
    /// MFT index of each scanned record's parent directory.
    parents: BTreeMap<u64, u64>,
}

impl Tree {
    /// Scan every MFT record from the first non-reserved index up and build
    /// the folder graph. Records failing the magic, fixup, or
    /// in-use/directory checks are skipped; a volume without a root
    /// directory is rejected.
    pub fn build<D: DiskRead>(ntfs: &mut Ntfs<D>) -> Result<Self, NtfsError> {
        let record_count = ntfs.mft_size() / ntfs.bytes_per_file_record() as u64;
        if record_count > MFT_MASK {
            return Err(NtfsError::InvalidData(
                "MFT record count exceeds the 48-bit index space".into(),
            ));
        }

        let mut tree = Self {
            folders: BTreeMap::new(),
            parents: BTreeMap::new(),
        };
        let mut record = vec![0u8; ntfs.bytes_per_file_record() as usize];
        let mut kept = 0u64;

        for index in MFT_INDEX_FIRST_USER..record_count {
            if !ntfs.read_file_record(index, &mut record)? {
                continue;
            }
            let flags = u16_at(&record, 0x16);
            if flags & (FILE_FLAG_IN_USE | FILE_FLAG_DIRECTORY) == 0 {
                continue;
            }

            let mut node = Node {
                mft_ref: index,
                is_dir: flags & FILE_FLAG_DIRECTORY != 0,
                ..Node::default()
            };
            if node.is_dir {
                tree.folders.entry(index).or_default();
            }

            let attributes = attr::parse_attributes(&record)?;
            tree.process_attributes(ntfs, &mut node, &attributes, 0, 0)?;

            // a parent of zero marks extension records owned by some other
            // base record; they are reached through its attribute list
            if node.parent_ref == 0 || node.mft_ref == MFT_INDEX_ROOT {
                continue;
            }
            tree.folders.entry(node.parent_ref).or_default().push(node);
            kept += 1;
        }

        if !tree.folders.contains_key(&MFT_INDEX_ROOT) {
            return Err(NtfsError::InvalidData(
                "volume has no root directory".into(),
            ));
        }
        debug!(
            "MFT scan kept {kept} of {record_count} records across {} folders",
            tree.folders.len()
        );
        Ok(tree)
    }

    /// Children of the directory with MFT index `folder`.
    pub fn folder(&self, folder: u64) -> Option<&[Node]> {
        self.folders.get(&folder).map(Vec::as_slice)
    }

    /// Parent directory of a scanned record.
    pub fn parent_of(&self, mft_ref: u64) -> Option<u64> {
        self.parents.get(&mft_ref).copied()
    }

    fn process_attributes<D: DiskRead>(
        &mut self,
        ntfs: &mut Ntfs<D>,
        node: &mut Node,
        attributes: &[Attribute],
        list_ref: u64,
        list_attr_id: u16,
    ) -> Result<(), NtfsError> {
        for attribute in attributes {
            match attribute.attr_type {
                ATTR_FILE_NAME => self.decode_file_name(node, attribute)?,
                ATTR_DATA => decode_data_stream(node, attribute, list_ref, list_attr_id)?,
                ATTR_ATTRIBUTE_LIST => {
                    // extension records never carry lists of their own;
                    // recursion stops at depth two
                    if list_ref != 0 {
                        continue;
                    }
                    self.recurse_attr_list(ntfs, node, attribute)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn decode_file_name(&mut self, node: &mut Node, attribute: &Attribute) -> Result<(), NtfsError> {
        let AttrBody::Resident { value } = &attribute.body else {
            return Err(NtfsError::InvalidData(
                "non-resident file name attribute".into(),
            ));
        };
        let fname = attr::parse_file_name(value)?;
        node.file_attributes = fname.file_attributes;
        node.parent_ref = fname.parent_ref & MFT_MASK;
        if fname.name_type & 0x2 != 0 {
            node.short_name = fname.name.clone();
        }
        if fname.name_type & 0x1 != 0 {
            node.name = fname.name.clone();
        }
        self.parents.insert(node.mft_ref, node.parent_ref);
        Ok(())
    }

    /// Read each record the attribute list references and fold its
    /// attributes into `node`.
    fn recurse_attr_list<D: DiskRead>(
        &mut self,
        ntfs: &mut Ntfs<D>,
        node: &mut Node,
        attribute: &Attribute,
    ) -> Result<(), NtfsError> {
        let AttrBody::Resident { value } = &attribute.body else {
            return Err(NtfsError::Unsupported(
                "non-resident attribute list".into(),
            ));
        };
        let entries = attr::parse_attr_list(value)?;
        let mut record = vec![0u8; ntfs.bytes_per_file_record() as usize];

        for entry in entries {
            if entry.file_ref & MFT_MASK == 0 {
                continue;
            }
            if !ntfs.read_file_record(entry.file_ref, &mut record)? {
                continue;
            }
            if u16_at(&record, 0x16) & FILE_FLAG_IN_USE == 0 {
                continue;
            }
            let attributes = attr::parse_attributes(&record)?;
            self.process_attributes(
                ntfs,
                node,
                &attributes,
                entry.file_ref & MFT_MASK,
                entry.attr_id,
            )?;
        }
        Ok(())
    }

    /// Write the folder hierarchy depth-first in listing form: a header
    /// line per folder, then a tab-indented `name[:stream]<TAB>size` line
    /// per file stream, files before subfolders.
    pub fn write_listing(
        &self,
        prefix: &str,
        out: &mut dyn Write,
        folder: u64,
    ) -> Result<(), NtfsError> {
        let nodes = self.folders.get(&folder).ok_or_else(|| {
            NtfsError::NotFound(format!("no folder with MFT index {folder}"))
        })?;

        let mut header = prefix.to_string();
        if header.len() < 3 && !header.ends_with('\\') {
            header.push('\\');
        }
        writeln!(out, "{header}")?;

        for node in nodes.iter().filter(|n| !n.is_dir) {
            let name = String::from_utf16_lossy(&node.name);
            for stream in node.streams.values() {
                if stream.name.is_empty() {
                    writeln!(out, "\t{name}\t{}", stream.real_size)?;
                } else {
                    writeln!(
                        out,
                        "\t{name}:{}\t{}",
                        String::from_utf16_lossy(&stream.name),
                        stream.real_size
                    )?;
                }
            }
        }

        for node in nodes.iter().filter(|n| n.is_dir) {
            let child_prefix = format!("{prefix}\\{}", String::from_utf16_lossy(&node.name));
            self.write_listing(&child_prefix, out, node.mft_ref)?;
        }
        Ok(())
    }
}

/// Fold a `$DATA` attribute into the node's stream map.
///
/// The first sighting of a stream name captures the stream. A second
/// sighting must agree on residency; inside an attribute-list recursion it
/// extends the run list when the attribute id matches the list entry, and
/// outside one it must carry identical content.
fn decode_data_stream(
    node: &mut Node,
    attribute: &Attribute,
    list_ref: u64,
    list_attr_id: u16,
) -> Result<(), NtfsError> {
    match node.streams.get_mut(&attribute.name) {
        None => {
            let mut stream = Stream {
                name: attribute.name.clone(),
                resident: attribute.is_resident(),
                real_size: attribute.data_length(),
                compressed: attribute.is_compressed(),
                ..Stream::default()
            };
            match &attribute.body {
                AttrBody::Resident { value } => stream.data = value.clone(),
                AttrBody::NonResident {
                    start_vcn,
                    run_bytes,
                    compression_unit,
                    compressed_size,
                    ..
                } => {
                    stream.compression_unit = *compression_unit;
                    stream.compressed_size = *compressed_size;
                    stream.run.init(run_bytes, *start_vcn)?;
                }
            }
            node.streams.insert(attribute.name.clone(), stream);
        }
        Some(existing) => {
            if existing.resident != attribute.is_resident() {
                return Err(NtfsError::InvalidData(
                    "stream residency differs between records".into(),
                ));
            }
            if list_ref != 0 {
                let AttrBody::NonResident {
                    start_vcn,
                    run_bytes,
                    ..
                } = &attribute.body
                else {
                    return Err(NtfsError::InvalidData(
                        "fragmented stream chunk is stored resident".into(),
                    ));
                };
                if existing.run.is_empty() {
                    return Err(NtfsError::InvalidData(
                        "stream extension without an initial run list".into(),
                    ));
                }
                if attribute.attr_id == list_attr_id {
                    existing.run.append(run_bytes, *start_vcn)?;
                }
            } else {
                let payload: &[u8] = match &attribute.body {
                    AttrBody::Resident { value } => value,
                    AttrBody::NonResident { run_bytes, .. } => run_bytes,
                };
                if payload != existing.data.as_slice() {
                    return Err(NtfsError::InvalidData(
                        "duplicate stream with different content".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}
