use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::constants::DEFAULT_CHUNK_SIZE;
use crate::error::TransferError;

/// Reads up to `chunk_size` bytes starting at `offset`.
///
/// The result is shorter only at end of file, and empty once nothing is left.
pub fn read_chunk<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    chunk_size: u64,
) -> io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(chunk_size.min(64 * 1024 * 1024) as usize);
    reader.by_ref().take(chunk_size).read_to_end(&mut buf)?;
    Ok(buf)
}

/// A local file read in fixed-size windows.
pub struct ChunkReader {
    file: File,
    size: u64,
    chunk_size: u64,
}

impl ChunkReader {
    /// Opens `path`. A `chunk_size` of 0 selects the 8 MiB default.
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            size,
            chunk_size,
        })
    }

    pub fn read_at(&mut self, offset: u64) -> Result<Vec<u8>, TransferError> {
        Ok(read_chunk(&mut self.file, offset, self.chunk_size)?)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    /// Hands out at most `limit` bytes per read call.
    struct Trickle<R> {
        inner: R,
        limit: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.inner.read(&mut buf[..n])
        }
    }

    impl<R: Seek> Seek for Trickle<R> {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn reads_full_windows_and_tail() {
        let mut src = Cursor::new(b"AABBCCDDEE".to_vec());
        assert_eq!(read_chunk(&mut src, 0, 4).unwrap(), b"AABB");
        assert_eq!(read_chunk(&mut src, 4, 4).unwrap(), b"CCDD");
        assert_eq!(read_chunk(&mut src, 8, 4).unwrap(), b"EE");
    }

    #[test]
    fn at_or_past_eof_is_empty() {
        let mut src = Cursor::new(b"0123".to_vec());
        assert!(read_chunk(&mut src, 4, 4).unwrap().is_empty());
        assert!(read_chunk(&mut src, 100, 4).unwrap().is_empty());
    }

    #[test]
    fn short_reads_are_filled() {
        let mut src = Trickle {
            inner: Cursor::new((0u8..100).collect::<Vec<_>>()),
            limit: 3,
        };
        let chunk = read_chunk(&mut src, 10, 50).unwrap();
        assert_eq!(chunk.len(), 50);
        assert_eq!(chunk[0], 10);
        assert_eq!(chunk[49], 59);
    }

    #[test]
    fn chunk_reader_on_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"0123456789").unwrap();
        f.flush().unwrap();

        let mut reader = ChunkReader::open(f.path(), 4).unwrap();
        assert_eq!(reader.size(), 10);
        assert_eq!(reader.read_at(6).unwrap(), b"6789");
        assert_eq!(reader.read_at(8).unwrap(), b"89");
        assert!(reader.read_at(10).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let f = NamedTempFile::new().unwrap();
        let reader = ChunkReader::open(f.path(), 0).unwrap();
        assert_eq!(reader.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(reader.size(), 0);
    }
}
