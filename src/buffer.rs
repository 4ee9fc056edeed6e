//! A seekable, append-and-grow byte buffer used as the framing medium for
//! every wire command. Segment list avoids copy-on-grow: a write past the
//! current extent allocates exactly one new segment sized to the overflow,
//! zero-filled, rather than reallocating and copying everything seen so far.

use std::fs::File;
use std::io::Write;

use anyhow::{bail, Result};

/// Guards against a single pathological write demanding an enormous
/// contiguous allocation.
const MAX_SEGMENT_SIZE: usize = 1 << 30; // 1 GiB

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Default)]
pub struct GrowingBuffer {
    segments: Vec<Vec<u8>>,
    /// Logical cursor, independent of segment boundaries.
    cursor: usize,
}

impl GrowingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::new();
        buf.write(bytes)?;
        buf.seek(0, Whence::Set)?;
        Ok(buf)
    }

    /// Total allocated (and thus writable) extent.
    pub fn size(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    fn grow_to(&mut self, target: usize) -> Result<()> {
        let current = self.size();
        if target <= current {
            return Ok(());
        }
        let needed = target - current;
        if needed > MAX_SEGMENT_SIZE {
            bail!(
                "growing buffer segment allocation of {} bytes exceeds the {} byte cap",
                needed,
                MAX_SEGMENT_SIZE
            );
        }
        self.segments.push(vec![0u8; needed]);
        Ok(())
    }

    /// Appends `bytes` at the current cursor, growing the buffer if needed,
    /// and advances the cursor.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let end = self
            .cursor
            .checked_add(bytes.len())
            .ok_or_else(|| anyhow::anyhow!("growing buffer write overflowed usize"))?;
        self.grow_to(end)?;

        let mut remaining = bytes;
        let mut pos = self.cursor;
        for seg in self.segments.iter_mut() {
            if remaining.is_empty() {
                break;
            }
            if pos >= seg.len() {
                pos -= seg.len();
                continue;
            }
            let avail = seg.len() - pos;
            let n = avail.min(remaining.len());
            seg[pos..pos + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            pos = 0;
        }
        self.cursor = end;
        Ok(bytes.len())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write(&[v])?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_le_bytes())?;
        Ok(())
    }

    /// Reads `buf.len()` bytes from the current cursor; reading past `size()`
    /// is a failure, never a silent short read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.cursor + buf.len();
        if end > self.size() {
            bail!(
                "read of {} bytes at offset {} past end of buffer (size {})",
                buf.len(),
                self.cursor,
                self.size()
            );
        }
        let mut pos = self.cursor;
        let mut written = 0usize;
        for seg in &self.segments {
            if written >= buf.len() {
                break;
            }
            if pos >= seg.len() {
                pos -= seg.len();
                continue;
            }
            let avail = seg.len() - pos;
            let n = avail.min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&seg[pos..pos + n]);
            written += n;
            pos = 0;
        }
        self.cursor = end;
        Ok(buf.len())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; n];
        self.read(&mut v)?;
        Ok(v)
    }

    /// Seeks to a new cursor position. Clamped to `[0, size()]`; a negative
    /// target is a failure.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<usize> {
        let base: i64 = match whence {
            Whence::Set => 0,
            Whence::Cur => self.cursor as i64,
            Whence::End => self.size() as i64,
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| anyhow::anyhow!("seek overflowed"))?;
        if target < 0 {
            bail!("seek to negative offset {}", target);
        }
        self.cursor = (target as usize).min(self.size());
        Ok(self.cursor)
    }

    /// Streams `n` bytes starting at the current cursor to `file`, without
    /// materializing the whole buffer.
    pub fn dump_to_file(&self, file: &mut File, n: usize) -> Result<()> {
        let available = self.size().saturating_sub(self.cursor);
        if n > available {
            bail!("dump_to_file requested {} bytes but only {} available", n, available);
        }
        let mut remaining = n;
        let mut pos = self.cursor;
        for seg in &self.segments {
            if remaining == 0 {
                break;
            }
            if pos >= seg.len() {
                pos -= seg.len();
                continue;
            }
            let avail = seg.len() - pos;
            let take = avail.min(remaining);
            file.write_all(&seg[pos..pos + take])?;
            remaining -= take;
            pos = 0;
        }
        Ok(())
    }

    /// Materializes the full buffer contents as a contiguous `Vec<u8>`, for
    /// handing off to a socket write.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut buf = GrowingBuffer::new();
        buf.write(b"hello").unwrap();
        buf.write(b" world").unwrap();
        assert_eq!(buf.size(), 11);
        buf.seek(0, Whence::Set).unwrap();
        let mut out = vec![0u8; 11];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn tell_matches_seek_target() {
        let mut buf = GrowingBuffer::new();
        buf.write(&[0u8; 100]).unwrap();
        buf.seek(40, Whence::Set).unwrap();
        assert_eq!(buf.tell(), 40);
        buf.seek(-10, Whence::Cur).unwrap();
        assert_eq!(buf.tell(), 30);
        buf.seek(0, Whence::End).unwrap();
        assert_eq!(buf.tell(), 100);
    }

    #[test]
    fn seek_before_zero_fails() {
        let mut buf = GrowingBuffer::new();
        buf.write(b"abc").unwrap();
        assert!(buf.seek(-1, Whence::Set).is_err());
    }

    #[test]
    fn seek_past_end_clamps() {
        let mut buf = GrowingBuffer::new();
        buf.write(b"abc").unwrap();
        let pos = buf.seek(1000, Whence::Set).unwrap();
        assert_eq!(pos, 3);
    }

    #[test]
    fn read_past_end_fails() {
        let mut buf = GrowingBuffer::new();
        buf.write(b"abc").unwrap();
        buf.seek(0, Whence::Set).unwrap();
        let mut out = [0u8; 10];
        assert!(buf.read(&mut out).is_err());
    }

    #[test]
    fn typed_helpers_roundtrip() {
        let mut buf = GrowingBuffer::new();
        buf.write_u64(0xdead_beef_cafe_1234).unwrap();
        buf.write_u8(7).unwrap();
        buf.seek(0, Whence::Set).unwrap();
        assert_eq!(buf.read_u64().unwrap(), 0xdead_beef_cafe_1234);
        assert_eq!(buf.read_u8().unwrap(), 7);
    }

    #[test]
    fn writes_spanning_multiple_segments_read_back_correctly() {
        let mut buf = GrowingBuffer::new();
        // force several distinct segment allocations
        for chunk in [b"aaaa".to_vec(), b"bbbb".to_vec(), b"cc".to_vec()] {
            buf.write(&chunk).unwrap();
        }
        buf.seek(2, Whence::Set).unwrap();
        let got = buf.read_vec(6).unwrap();
        assert_eq!(&got, b"aabbbb");
    }
}
