use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unsupported extent: {0}")]
    UnsupportedExtent(String),

    #[error("Invalid partition table: {0}")]
    InvalidPartitionTable(String),

    #[error("Sector {lba} out of range")]
    SectorOutOfRange { lba: u64 },

    #[error("Partition {requested} out of range ({available} available)")]
    PartitionOutOfRange { requested: usize, available: usize },
}
