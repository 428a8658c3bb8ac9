//! Read-only traversal and extraction of NTFS filesystems stored inside
//! VMware VMDK disk images.
//!
//! The layers nest strictly: a [`vmdk::VmdkDisk`] resolves whole-disk sector
//! numbers through its extent chain (falling through to a parent snapshot
//! for unallocated sectors), [`partition`] enumerates MBR/EBR partitions,
//! and [`ntfs`] parses one partition's volume into a browsable tree from
//! which [`ntfs::NtfsFile`] serves positioned reads.

pub mod disk;
pub mod driver;
pub mod error;
pub mod ntfs;
pub mod partition;
pub mod vmdk;
