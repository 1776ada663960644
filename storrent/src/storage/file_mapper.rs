use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Bound;

use super::LocalFile;

struct MappedFile {
    file: File,
    /// Flat offset of the file's first byte.
    start_offset: u64,
    /// Flat offset one past the file's last byte; the BTreeMap key.
    end_offset: u64,
}

/// Presents an ordered list of on-disk files as one seekable byte stream.
///
/// Offset-to-file lookup is O(log N) over a tree keyed by each file's end
/// offset. Reads and writes carry across file boundaries transparently;
/// the files must already exist at their declared lengths.
pub struct MultiFileMapper {
    files: Vec<MappedFile>,
    by_end_offset: BTreeMap<u64, usize>,
    total_length: u64,
    current_offset: u64,
}

impl MultiFileMapper {
    pub fn open(local_files: &[LocalFile]) -> io::Result<MultiFileMapper> {
        let mut files = Vec::with_capacity(local_files.len());
        let mut by_end_offset = BTreeMap::new();
        let mut total_length = 0u64;

        for (index, local_file) in local_files.iter().enumerate() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&local_file.path)?;
            let start_offset = total_length;
            total_length += local_file.length;
            files.push(MappedFile {
                file,
                start_offset,
                end_offset: total_length,
            });
            if local_file.length > 0 {
                by_end_offset.insert(total_length, index);
            }
        }

        Ok(MultiFileMapper {
            files,
            by_end_offset,
            total_length,
            current_offset: 0,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Positions the stream at a flat offset. Offsets at or past the total
    /// length are invalid.
    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        if offset >= self.total_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid offset {} (total length {})", offset, self.total_length),
            ));
        }
        self.current_offset = offset;
        Ok(())
    }

    /// Fills the whole buffer starting at the current position, crossing
    /// file boundaries as needed.
    pub fn read_until_filled(&mut self, buffer: &mut [u8]) -> io::Result<()> {
        let mut nread = 0;
        while nread < buffer.len() {
            let (file_index, within, available) = self.locate(buffer.len() - nread)?;
            let chunk = &mut buffer[nread..nread + available];

            let mapped = &mut self.files[file_index];
            mapped.file.seek(SeekFrom::Start(within))?;
            mapped.file.read_exact(chunk)?;

            self.current_offset += available as u64;
            nread += available;
        }
        Ok(())
    }

    /// Writes the whole buffer starting at the current position, crossing
    /// file boundaries as needed.
    pub fn write_until_depleted(&mut self, buffer: &[u8]) -> io::Result<()> {
        let mut nwritten = 0;
        while nwritten < buffer.len() {
            let (file_index, within, available) = self.locate(buffer.len() - nwritten)?;
            let chunk = &buffer[nwritten..nwritten + available];

            let mapped = &mut self.files[file_index];
            mapped.file.seek(SeekFrom::Start(within))?;
            mapped.file.write_all(chunk)?;

            self.current_offset += available as u64;
            nwritten += available;
        }
        Ok(())
    }

    // Maps the current offset to (file index, offset within the file, byte
    // count available in that file capped at `wanted`).
    fn locate(&self, wanted: usize) -> io::Result<(usize, u64, usize)> {
        let (end_offset, file_index) = self
            .by_end_offset
            .range((Bound::Excluded(self.current_offset), Bound::Unbounded))
            .next()
            .map(|(end, index)| (*end, *index))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Reached end of the last file before completing the transfer",
                )
            })?;

        let mapped = &self.files[file_index];
        let within = self.current_offset - mapped.start_offset;
        let available = ((end_offset - self.current_offset) as usize).min(wanted);
        Ok((file_index, within, available))
    }
}
