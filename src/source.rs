// Byte-source capability: whatever a consumer provides must support a
// positioned read and report a known size.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::{BdeError, ErrorKind, Result};

/// Random-access read over a volume image. Owned by the caller; a `Volume`
/// only ever borrows it.
pub trait ByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read. A short read is only valid at EOF.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`, failing with
    /// `read_failed` on a short read (anything other than a plain EOF
    /// truncation is handled by the caller; this helper is for callers that
    /// need an exact amount or nothing).
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n != buf.len() {
            return Err(BdeError::new(
                ErrorKind::ReadFailed,
                format!("short read at offset {}: got {} of {} bytes", offset, n, buf.len()),
            ));
        }
        Ok(())
    }
}

/// A plain file on disk. Uses a `Mutex<File>` plus seek+read since `pread`
/// is not portably available through `std` alone.
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileSource {
            file: Mutex::new(file),
            size,
        })
    }

    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(FileSource {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0usize;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory volume image, borrowed or owned.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        MemorySource { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One contiguous range of a `SplitSource`'s virtual address space.
struct Segment {
    start: u64,
    len: u64,
    child: Box<dyn ByteSource>,
}

/// A set of byte sources concatenated into one virtual address space, for
/// images split across several files or memory regions (the "split-image"
/// case called out by the polymorphic-I/O design note).
pub struct SplitSource {
    segments: Vec<Segment>,
    size: u64,
}

impl SplitSource {
    pub fn new() -> Self {
        SplitSource {
            segments: Vec::new(),
            size: 0,
        }
    }

    /// Appends a child source immediately after the current end of the
    /// virtual address space.
    pub fn push(&mut self, child: Box<dyn ByteSource>) {
        let len = child.size();
        self.segments.push(Segment {
            start: self.size,
            len,
            child,
        });
        self.size += len;
    }
}

impl Default for SplitSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSource for SplitSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        // Binary search isn't worth it for the handful of segments a split
        // image typically has; scan linearly.
        let mut total = 0usize;
        let mut pos = offset;
        while total < buf.len() && pos < self.size {
            let seg = self
                .segments
                .iter()
                .find(|s| pos >= s.start && pos < s.start + s.len)
                .ok_or_else(|| BdeError::new(ErrorKind::ReadFailed, "split source gap"))?;
            let seg_offset = pos - seg.start;
            let want = ((seg.len - seg_offset) as usize).min(buf.len() - total);
            let n = seg.child.read_at(seg_offset, &mut buf[total..total + want])?;
            if n == 0 {
                break;
            }
            total += n;
            pos += n as u64;
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_in_range_and_truncates_at_eof() {
        let src = MemorySource::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(src.read_at(1, &mut buf).unwrap(), 3);
        assert_eq!(buf, [2, 3, 4]);

        let mut tail = [0u8; 4];
        assert_eq!(src.read_at(3, &mut tail).unwrap(), 2);
        assert_eq!(&tail[..2], &[4, 5]);

        let mut past = [0u8; 2];
        assert_eq!(src.read_at(10, &mut past).unwrap(), 0);
    }

    #[test]
    fn split_source_concatenates_children() {
        let mut split = SplitSource::new();
        split.push(Box::new(MemorySource::new(vec![1u8, 2, 3])));
        split.push(Box::new(MemorySource::new(vec![4u8, 5, 6, 7])));
        assert_eq!(split.size(), 7);

        let mut buf = [0u8; 5];
        assert_eq!(split.read_at(2, &mut buf).unwrap(), 5);
        assert_eq!(buf, [3, 4, 5, 6, 7]);
    }
}
