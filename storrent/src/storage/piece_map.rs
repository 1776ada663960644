use std::io;

use sha1::{Digest, Sha1};

use super::file_mapper::MultiFileMapper;
use super::LocalFile;

/// Translates piece indices to byte ranges of the flat torrent stream and
/// reads/writes whole pieces through a `MultiFileMapper`.
pub struct PieceDataMap {
    piece_length: u64,
    piece_hashes: Vec<u8>,
    mapper: MultiFileMapper,
}

impl PieceDataMap {
    /// Opens the data map over the given files. `piece_hashes` is the
    /// concatenation of the torrent's declared 20-byte piece hashes.
    pub fn open(
        piece_length: u64,
        piece_hashes: Vec<u8>,
        local_files: &[LocalFile],
    ) -> io::Result<PieceDataMap> {
        Ok(PieceDataMap {
            piece_length,
            piece_hashes,
            mapper: MultiFileMapper::open(local_files)?,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.mapper.total_length()
    }

    /// Length of the piece at `index`; only the last piece may be short.
    pub fn piece_length_at(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length
            .min(self.mapper.total_length().saturating_sub(start))
    }

    /// Reads `buffer.len()` bytes of the piece at `index`, from its start.
    pub fn read_piece(&mut self, index: u32, buffer: &mut [u8]) -> io::Result<()> {
        if buffer.len() as u64 > self.piece_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Buffer is larger than a piece",
            ));
        }
        self.mapper.seek(index as u64 * self.piece_length)?;
        self.mapper.read_until_filled(buffer)
    }

    /// Writes a complete piece at `index`.
    pub fn write_piece(&mut self, index: u32, data: &[u8]) -> io::Result<()> {
        self.mapper.seek(index as u64 * self.piece_length)?;
        self.mapper.write_until_depleted(data)
    }

    /// Reads the piece at `index` and compares its SHA-1 to the declared
    /// hash. A mismatch (or a missing declared hash) is `Ok(false)`; only
    /// io failures are errors.
    pub fn check_piece(&mut self, index: u32) -> io::Result<bool> {
        let expected = match self
            .piece_hashes
            .get(index as usize * 20..index as usize * 20 + 20)
        {
            Some(expected) => expected.to_vec(),
            None => return Ok(false),
        };

        let mut data = vec![0u8; self.piece_length_at(index) as usize];
        self.read_piece(index, &mut data)?;

        Ok(Sha1::digest(&data).as_slice() == expected.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::ensure_local_files;
    use tempfile::tempdir;

    // 2 full pieces of 8 bytes and a final piece of 4, spread over 2 files.
    fn build_map(dir: &std::path::Path, data: &[u8]) -> PieceDataMap {
        assert_eq!(data.len(), 20);
        let files = vec![
            LocalFile::new(dir.join("a.bin"), 13),
            LocalFile::new(dir.join("b.bin"), 7),
        ];
        ensure_local_files(&files).unwrap();

        let mut hashes = Vec::new();
        for piece in [&data[0..8], &data[8..16], &data[16..20]] {
            hashes.extend(Sha1::digest(piece));
        }

        let mut map = PieceDataMap::open(8, hashes, &files).unwrap();
        map.mapper.seek(0).unwrap();
        map.mapper.write_until_depleted(data).unwrap();
        map
    }

    #[test]
    fn test_piece_lengths() {
        let dir = tempdir().unwrap();
        let map = build_map(dir.path(), &[0u8; 20]);
        assert_eq!(map.piece_length_at(0), 8);
        assert_eq!(map.piece_length_at(1), 8);
        assert_eq!(map.piece_length_at(2), 4);
    }

    #[test]
    fn test_write_then_read_piece() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..20).collect();
        let mut map = build_map(dir.path(), &data);

        map.write_piece(1, &[9u8; 8]).unwrap();

        let mut buffer = [0u8; 8];
        map.read_piece(1, &mut buffer).unwrap();
        assert_eq!(buffer, [9u8; 8]);

        // neighbours untouched
        let mut buffer = [0u8; 8];
        map.read_piece(0, &mut buffer).unwrap();
        assert_eq!(buffer[..], data[0..8]);
    }

    #[test]
    fn test_read_piece_rejects_oversized_buffer() {
        let dir = tempdir().unwrap();
        let mut map = build_map(dir.path(), &[0u8; 20]);
        let mut buffer = [0u8; 9];
        assert!(map.read_piece(0, &mut buffer).is_err());
    }

    #[test]
    fn test_check_piece() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (100..120).collect();
        let mut map = build_map(dir.path(), &data);

        assert!(map.check_piece(0).unwrap());
        assert!(map.check_piece(1).unwrap());
        // short last piece hashes over its real length only
        assert!(map.check_piece(2).unwrap());

        map.write_piece(1, &[0u8; 8]).unwrap();
        assert!(!map.check_piece(1).unwrap());

        // index with no declared hash
        assert!(!map.check_piece(9).unwrap());
    }
}
