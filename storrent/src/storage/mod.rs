pub mod allocator;
pub mod file_mapper;
pub mod piece_map;

use std::path::PathBuf;

/// A torrent file materialized on disk: where it lives and how long it must
/// be. The list order is the torrent's declared file order; concatenating
/// the files in this order yields the flat torrent byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub length: u64,
}

impl LocalFile {
    pub fn new(path: PathBuf, length: u64) -> Self {
        Self { path, length }
    }
}
