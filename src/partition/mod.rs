pub mod mbr;

pub use mbr::{read_partition_table, ChsAddress, Partition};
