//! Sequential byte sources of decoded PCM.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

/// Readable stream of interleaved PCM bytes with a known length.
pub trait PcmSource: Send {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Current read cursor in bytes.
    fn position(&self) -> u64;

    /// Read up to `buf.len()` bytes. `Ok(0)` signals exhaustion.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Move the read cursor to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes left between the read cursor and the end.
    fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position())
    }
}

impl<T> PcmSource for Cursor<T>
where
    T: AsRef<[u8]> + Send,
{
    fn len(&self) -> u64 {
        self.get_ref().as_ref().len() as u64
    }

    fn position(&self) -> u64 {
        Cursor::position(self)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.set_position(offset);
        Ok(())
    }
}

/// Adapter for any `Read + Seek` stream (files, spooled downloads).
///
/// The length is measured once at construction; the stream is assumed not to grow.
pub struct SeekableSource<R> {
    inner: R,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SeekableSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(Self { inner, len, pos })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> PcmSource for SeekableSource<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.pos = self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

/// Fill as much of `buf` as the source allows, retrying short reads.
///
/// Returns fewer than `buf.len()` bytes only at end of stream.
pub(crate) fn read_full(source: &mut dyn PcmSource, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
