// Byte cursor: uniform reader/writer over in-memory buffers or streams

use std::io;

use crate::error::Error;

enum ReaderSource<'a> {
    Slice(&'a [u8]),
    Stream {
        inner: &'a mut dyn io::Read,
        buf: Vec<u8>,
        eof: bool,
    },
}

/// Positioned reader over a byte slice or a streaming source.
///
/// Stream bytes are buffered as they are consumed, so `seek` and `tell`
/// work within everything read so far. Unions re-read their members
/// from the same starting position, which relies on this.
pub struct Reader<'a> {
    source: ReaderSource<'a>,
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self {
            source: ReaderSource::Slice(data),
            pos: 0,
        }
    }

    pub fn from_stream(inner: &'a mut dyn io::Read) -> Self {
        Self {
            source: ReaderSource::Stream {
                inner,
                buf: Vec::new(),
                eof: false,
            },
            pos: 0,
        }
    }

    /// Current byte position
    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    /// Seek to an absolute position. Seeking forward on a stream pulls
    /// the intervening bytes into the buffer.
    pub fn seek(&mut self, pos: u64) -> Result<(), Error> {
        let pos = pos as usize;
        self.ensure(pos)?;
        self.pos = pos;
        Ok(())
    }

    /// Seek relative to the current position
    pub fn skip(&mut self, delta: i64) -> Result<(), Error> {
        let target = self.pos as i64 + delta;
        if target < 0 {
            return Err(Error::Truncated(format!(
                "seek to negative offset {}",
                target
            )));
        }
        self.seek(target as u64)
    }

    /// Make at least `end` bytes available (no-op for slices)
    fn ensure(&mut self, end: usize) -> Result<(), Error> {
        match &mut self.source {
            ReaderSource::Slice(data) => {
                if end > data.len() {
                    return Err(Error::Truncated(format!(
                        "position {} is past the end of a {} byte buffer",
                        end,
                        data.len()
                    )));
                }
            }
            ReaderSource::Stream { inner, buf, eof } => {
                while buf.len() < end && !*eof {
                    let mut chunk = [0u8; 4096];
                    let want = (end - buf.len()).min(chunk.len());
                    let n = inner
                        .read(&mut chunk[..want])
                        .map_err(|e| Error::Truncated(format!("stream read failed: {}", e)))?;
                    if n == 0 {
                        *eof = true;
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                if buf.len() < end {
                    return Err(Error::Truncated(format!(
                        "position {} is past the end of the stream ({} bytes)",
                        end,
                        buf.len()
                    )));
                }
            }
        }
        Ok(())
    }

    fn available(&self) -> &[u8] {
        match &self.source {
            ReaderSource::Slice(data) => data,
            ReaderSource::Stream { buf, .. } => buf,
        }
    }

    /// Read exactly `n` bytes, failing with `Truncated` on a short read
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| Error::Truncated(format!("read of {} bytes overflows position", n)))?;
        self.ensure(end).map_err(|_| {
            Error::Truncated(format!(
                "read {} bytes at offset {}, but only {} available",
                n,
                self.pos,
                self.available().len().saturating_sub(self.pos)
            ))
        })?;
        let out = self.available()[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    /// Read a fixed-size byte array
    pub fn read_arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self.read_bytes(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.read_arr::<1>()?[0])
    }

    /// Count the `unit`-sized elements before the next all-zero unit,
    /// without consuming anything. Fails with `Truncated` when the
    /// input ends before a zero unit is found.
    pub(crate) fn scan_to_zero(&mut self, unit: usize) -> Result<usize, Error> {
        debug_assert!(unit > 0);
        if unit == 1 {
            // Fast path over the bytes already in memory
            let avail = self.available();
            if self.pos <= avail.len() {
                if let Some(i) = memchr::memchr(0, &avail[self.pos..]) {
                    return Ok(i);
                }
            }
        }
        let mut count = 0;
        loop {
            let end = self.pos + (count + 1) * unit;
            self.ensure(end).map_err(|_| {
                Error::Truncated("input ended before the array terminator".to_string())
            })?;
            let elem = &self.available()[end - unit..end];
            if elem.iter().all(|&b| b == 0) {
                return Ok(count);
            }
            count += 1;
        }
    }
}

/// Positioned writer over a growable buffer. Seeking past the end
/// zero-fills the gap.
pub struct Writer {
    buf: Vec<u8>,
    pos: usize,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
        }
    }

    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, pos: u64) {
        let pos = pos as usize;
        if pos > self.buf.len() {
            self.buf.resize(pos, 0);
        }
        self.pos = pos;
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}
