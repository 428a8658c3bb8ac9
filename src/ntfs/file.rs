//! Path resolution over a scanned [`Tree`] and positioned reads on one
//! stream of one file, including sparse zero-fill and the 16-cluster
//! compression unit scheme.

use std::io::SeekFrom;

use log::debug;

use crate::disk::DiskRead;

use super::compress;
use super::tree::{Node, Stream, Tree};
use super::{Ntfs, NtfsError, MFT_INDEX_ROOT};

/// The only compression unit this reader handles: 16 clusters, the LZ77
/// variant's fixed group size (64 KiB at 4 KiB clusters).
const CLUSTERS_PER_GROUP: u64 = 16;

/// An open file: one stream of one resolved node, with a read cursor and a
/// one-cluster (or one-group) cache.
pub struct NtfsFile<'n, D: DiskRead> {
    ntfs: &'n mut Ntfs<D>,
    node: Node,
    stream: Stream,
    pos: u64,
    /// Cached LCN (plain streams) or group-start VCN (compressed streams)
    /// currently held in `cluster_buf`.
    cached: u64,
    cluster_buf: Vec<u8>,
    /// Raw, still-compressed group bytes; compressed streams only.
    compress_buf: Vec<u8>,
}

impl<'n, D: DiskRead> NtfsFile<'n, D> {
    /// Resolve `path` against the tree and open one of its streams.
    ///
    /// Components split on `/` or `\`. The terminal component may name an
    /// alternate stream as `file:stream`; the empty stream name selects the
    /// default stream. Components match either the long or the short (DOS)
    /// name. Matching is case-sensitive, unlike NTFS proper.
    pub fn open(ntfs: &'n mut Ntfs<D>, tree: &Tree, path: &str) -> Result<Self, NtfsError> {
        let mut folder = MFT_INDEX_ROOT;
        let mut target: Option<Node> = None;
        let mut stream_name: Vec<u16> = Vec::new();

        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            if target.is_some() {
                return Err(NtfsError::NotFound(format!(
                    "{path}: path continues past a file"
                )));
            }

            // a :stream suffix is only honored on the terminal component
            let (name_part, stream_part) = match component.split_once(':') {
                Some((name, stream)) => (name, stream),
                None => (component, ""),
            };
            stream_name = stream_part.encode_utf16().collect();
            let token: Vec<u16> = name_part.encode_utf16().collect();

            let nodes = tree
                .folder(folder)
                .ok_or_else(|| NtfsError::NotFound(format!("{path}: folder not in tree")))?;
            let node = nodes
                .iter()
                .find(|n| n.name == token || n.short_name == token)
                .ok_or_else(|| {
                    NtfsError::NotFound(format!("{path}: component {name_part} not found"))
                })?;

            if node.is_dir {
                folder = node.mft_ref;
            } else {
                target = Some(node.clone());
            }
        }

        let node =
            target.ok_or_else(|| NtfsError::NotFound(format!("{path} does not name a file")))?;
        let stream = node
            .streams
            .get(&stream_name)
            .cloned()
            .ok_or_else(|| {
                NtfsError::NotFound(format!(
                    "{path}: no stream named \"{}\"",
                    String::from_utf16_lossy(&stream_name)
                ))
            })?;

        let cluster_size = ntfs.cluster_size() as usize;
        let (cluster_buf, compress_buf) = if stream.compressed {
            // sized for the only supported unit; read() rejects others
            let group_size = cluster_size * CLUSTERS_PER_GROUP as usize;
            (vec![0u8; group_size], vec![0u8; group_size])
        } else {
            (vec![0u8; cluster_size], Vec::new())
        };

        debug!(
            "opened {path}: {} bytes, resident={}, compressed={}",
            stream.real_size, stream.resident, stream.compressed
        );
        Ok(Self {
            ntfs,
            node,
            stream,
            pos: 0,
            cached: u64::MAX,
            cluster_buf,
            compress_buf,
        })
    }

    /// The resolved directory entry this file was opened from.
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn size(&self) -> u64 {
        self.stream.real_size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.stream.real_size
    }

    /// Move the read cursor. A target outside `[0, size]` leaves the cursor
    /// unchanged and returns false.
    pub fn seek(&mut self, from: SeekFrom) -> bool {
        let target = match from {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.stream.real_size.checked_add_signed(delta),
        };
        match target {
            Some(pos) if pos <= self.stream.real_size => {
                self.pos = pos;
                true
            }
            _ => false,
        }
    }

    /// Read from the cursor into `buf`. Short reads happen only at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, NtfsError> {
        if self.stream.resident {
            self.read_resident(buf)
        } else if self.stream.compressed {
            self.read_compressed(buf)
        } else {
            self.read_plain(buf)
        }
    }

    fn read_resident(&mut self, buf: &mut [u8]) -> Result<usize, NtfsError> {
        if self.pos >= self.stream.real_size {
            return Ok(0);
        }
        let len = ((self.stream.real_size - self.pos) as usize).min(buf.len());
        let start = self.pos as usize;
        buf[..len].copy_from_slice(&self.stream.data[start..start + len]);
        self.pos += len as u64;
        Ok(len)
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> Result<usize, NtfsError> {
        let cluster_size = self.cluster_buf.len() as u64;
        let mut read = 0usize;

        while read < buf.len() && self.pos < self.stream.real_size {
            let vcn = self.pos / cluster_size;
            let lcn = self.stream.run.vcn_to_lcn(vcn)?;

            if lcn > 0 && lcn != self.cached {
                self.ntfs.read_lcn(lcn, 1, &mut self.cluster_buf)?;
                self.cached = lcn;
            } else if lcn == 0 {
                // sparse cluster
                self.cluster_buf.fill(0);
                self.cached = 0;
            }

            let offset = (self.pos % cluster_size) as usize;
            let len = (cluster_size as usize - offset)
                .min((self.stream.real_size - self.pos) as usize)
                .min(buf.len() - read);
            buf[read..read + len].copy_from_slice(&self.cluster_buf[offset..offset + len]);
            read += len;
            self.pos += len as u64;
        }
        Ok(read)
    }

    fn read_compressed(&mut self, buf: &mut [u8]) -> Result<usize, NtfsError> {
        let clusters_per_group = 1u64
            .checked_shl(self.stream.compression_unit as u32)
            .unwrap_or(0);
        if clusters_per_group != CLUSTERS_PER_GROUP {
            return Err(NtfsError::Unsupported(format!(
                "compression unit of 2^{} clusters, expected 16",
                self.stream.compression_unit
            )));
        }
        let cluster_size = self.ntfs.cluster_size() as u64;
        let group_size = self.cluster_buf.len() as u64;
        let mut read = 0usize;

        while read < buf.len() && self.pos < self.stream.real_size {
            let group_start_vcn = self.pos / group_size * clusters_per_group;

            if group_start_vcn != self.cached {
                // pull the group's clusters, noting which are allocated:
                // no bits set means a sparse group, all 16 set means the
                // group did not compress and is stored verbatim, anything
                // else is a compressed group
                let mut group_map: u32 = 0;
                for slot in 0..clusters_per_group {
                    let lcn = self.stream.run.vcn_to_lcn(group_start_vcn + slot)?;
                    let dst = (slot * cluster_size) as usize..((slot + 1) * cluster_size) as usize;
                    if lcn != 0 {
                        group_map |= 1 << slot;
                        self.ntfs.read_lcn(lcn, 1, &mut self.compress_buf[dst])?;
                    } else {
                        self.compress_buf[dst].fill(0);
                    }
                }

                if group_map == 0 {
                    self.cluster_buf.fill(0);
                } else if group_map == 0xFFFF {
                    self.cluster_buf.copy_from_slice(&self.compress_buf);
                } else {
                    self.cluster_buf.fill(0);
                    compress::decompress(&mut self.cluster_buf, &self.compress_buf)?;
                }
                self.cached = group_start_vcn;
            }

            let offset = (self.pos % group_size) as usize;
            let len = (group_size as usize - offset)
                .min((self.stream.real_size - self.pos) as usize)
                .min(buf.len() - read);
            buf[read..read + len].copy_from_slice(&self.cluster_buf[offset..offset + len]);
            read += len;
            self.pos += len as u64;
        }
        Ok(read)
    }
}
