use super::{u16_at, u32_at, u64_at, NtfsError};

pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_END: u32 = 0xFFFF_FFFF;

/// Attribute flag bit marking a compressed stream.
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;

/// Payload of an attribute, split by residency.
#[derive(Debug, Clone)]
pub enum AttrBody {
    /// Value stored inline in the record.
    Resident { value: Vec<u8> },
    /// Value stored in clusters described by a run list.
    NonResident {
        start_vcn: u64,
        last_vcn: u64,
        /// Log2 of the clusters per compression unit; meaningful only with
        /// the compressed flag.
        compression_unit: u16,
        allocated_size: u64,
        real_size: u64,
        /// Stored size of a compressed stream; zero otherwise.
        compressed_size: u64,
        /// The raw run-list bytes, up to the end of the attribute.
        run_bytes: Vec<u8>,
    },
}

/// One attribute decoded from an MFT record's attribute stream.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub attr_type: u32,
    pub length: u32,
    pub name: Vec<u16>,
    pub flags: u16,
    pub attr_id: u16,
    pub body: AttrBody,
}

impl Attribute {
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttrBody::Resident { .. })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    /// Length of the attribute's data: the real size when non-resident, the
    /// inline value length when resident.
    pub fn data_length(&self) -> u64 {
        match &self.body {
            AttrBody::Resident { value } => value.len() as u64,
            AttrBody::NonResident { real_size, .. } => *real_size,
        }
    }

    /// Parse one attribute at the start of `buf`, which extends to the end
    /// of the record; only the attribute's declared length is consumed.
    pub fn parse(buf: &[u8]) -> Result<Self, NtfsError> {
        if buf.len() < 0x10 {
            return Err(NtfsError::Parse("attribute header truncated".into()));
        }
        let attr_type = u32_at(buf, 0);
        let length = u32_at(buf, 4);
        if (length as usize) < 0x10 || length as usize > buf.len() {
            return Err(NtfsError::Parse(format!(
                "attribute length {length} out of range"
            )));
        }
        let attr = &buf[..length as usize];

        let non_resident = attr[8] != 0;
        let name_length = attr[9] as usize;
        let name_offset = u16_at(attr, 0x0A) as usize;
        let flags = u16_at(attr, 0x0C);
        let attr_id = u16_at(attr, 0x0E);

        let name = if name_length > 0 {
            let end = name_offset + name_length * 2;
            if end > attr.len() {
                return Err(NtfsError::Parse("attribute name out of range".into()));
            }
            attr[name_offset..end]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        } else {
            Vec::new()
        };

        let body = if non_resident {
            if attr.len() < 0x40 {
                return Err(NtfsError::Parse("non-resident attribute truncated".into()));
            }
            let run_offset = u16_at(attr, 0x20) as usize;
            if run_offset > attr.len() {
                return Err(NtfsError::Parse("run list offset out of range".into()));
            }
            let compressed_size = if flags & ATTR_FLAG_COMPRESSED != 0 {
                if attr.len() < 0x48 {
                    return Err(NtfsError::Parse("compressed attribute truncated".into()));
                }
                u64_at(attr, 0x40)
            } else {
                0
            };
            AttrBody::NonResident {
                start_vcn: u64_at(attr, 0x10),
                last_vcn: u64_at(attr, 0x18),
                compression_unit: u16_at(attr, 0x22),
                allocated_size: u64_at(attr, 0x28),
                real_size: u64_at(attr, 0x30),
                compressed_size,
                run_bytes: attr[run_offset..].to_vec(),
            }
        } else {
            if attr.len() < 0x18 {
                return Err(NtfsError::Parse("resident attribute truncated".into()));
            }
            let value_length = u32_at(attr, 0x10) as usize;
            let value_offset = u16_at(attr, 0x14) as usize;
            if value_offset + value_length > attr.len() {
                return Err(NtfsError::Parse("resident value out of range".into()));
            }
            AttrBody::Resident {
                value: attr[value_offset..value_offset + value_length].to_vec(),
            }
        };

        Ok(Self {
            attr_type,
            length,
            name,
            flags,
            attr_id,
            body,
        })
    }
}

/// Decode every attribute of a fixed-up record, from its `AttributesOffset`
/// to the 0xFFFFFFFF terminator.
pub fn parse_attributes(record: &[u8]) -> Result<Vec<Attribute>, NtfsError> {
    if record.len() < 0x18 {
        return Err(NtfsError::Parse("record too small for attributes".into()));
    }
    let mut pos = u16_at(record, 0x14) as usize;
    let mut attributes = Vec::new();

    while pos + 4 <= record.len() {
        let attr_type = u32_at(record, pos);
        if attr_type == ATTR_END || attr_type == 0 {
            break;
        }
        let attribute = Attribute::parse(&record[pos..])?;
        pos += attribute.length as usize;
        attributes.push(attribute);
    }
    Ok(attributes)
}

/// One entry of an `$ATTRIBUTE_LIST` value: which record carries which
/// attribute, and at which starting VCN.
#[derive(Debug, Clone)]
pub struct AttrListEntry {
    pub attr_type: u32,
    pub start_vcn: u64,
    pub file_ref: u64,
    pub attr_id: u16,
}

/// Iterate the entries of a resident `$ATTRIBUTE_LIST` value.
pub fn parse_attr_list(value: &[u8]) -> Result<Vec<AttrListEntry>, NtfsError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + 0x1A <= value.len() {
        let length = u16_at(value, pos + 4) as usize;
        if length == 0 {
            break;
        }
        if pos + length > value.len() {
            return Err(NtfsError::Parse("attribute list entry out of range".into()));
        }
        entries.push(AttrListEntry {
            attr_type: u32_at(value, pos),
            start_vcn: u64_at(value, pos + 0x08),
            file_ref: u64_at(value, pos + 0x10),
            attr_id: u16_at(value, pos + 0x18),
        });
        pos += length;
    }
    Ok(entries)
}

/// Decoded `$FILE_NAME` value.
#[derive(Debug, Clone)]
pub struct FileNameAttr {
    pub parent_ref: u64,
    pub file_attributes: u32,
    /// 0x01 = Win32 long name, 0x02 = DOS short name; both bits set when
    /// one name serves as both.
    pub name_type: u8,
    pub name: Vec<u16>,
}

/// Parse a `$FILE_NAME` attribute value (UTF-16LE name included).
pub fn parse_file_name(value: &[u8]) -> Result<FileNameAttr, NtfsError> {
    if value.len() < 0x42 {
        return Err(NtfsError::Parse("file name attribute truncated".into()));
    }
    let name_length = value[0x40] as usize;
    let end = 0x42 + name_length * 2;
    if end > value.len() {
        return Err(NtfsError::Parse("file name out of range".into()));
    }
    Ok(FileNameAttr {
        parent_ref: u64_at(value, 0),
        file_attributes: u32_at(value, 0x38),
        name_type: value[0x41],
        name: value[0x42..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    })
}
