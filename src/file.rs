use crate::error::{Qcow2Error, Qcow2Result};
use crate::ops::Qcow2IoOps;
use std::cell::Cell;

/// Zero buffer granularity for [`Qcow2ImageFile::zero_fill`].
const ZERO_CHUNK: usize = 64 << 10;

/// Positioned-I/O wrapper over a [`Qcow2IoOps`] backend.
///
/// Adds the contracts the metadata engines rely on: exact-length
/// reads, whole-buffer writes gated on `allow_beyond_eof`, zero
/// filling, and a cached file length so the EOF gate does not issue a
/// syscall per write.
#[derive(Debug)]
pub struct Qcow2ImageFile<T> {
    io: T,
    length: Cell<u64>,
    allow_beyond_eof: bool,
}

impl<T: Qcow2IoOps> Qcow2ImageFile<T> {
    pub fn new(io: T, allow_beyond_eof: bool) -> Qcow2Result<Self> {
        let length = io.get_length()?;
        Ok(Qcow2ImageFile {
            io,
            length: Cell::new(length),
            allow_beyond_eof,
        })
    }

    pub fn length(&self) -> u64 {
        self.length.get()
    }

    /// Fill `buf` completely from `offset` or fail with `ShortRead`.
    pub fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Qcow2Result<()> {
        log::trace!("read_exact off {:x} len {}", offset, buf.len());
        let done = self.io.read_to(offset, buf)?;
        if done != buf.len() {
            return Err(Qcow2Error::short_read(format!(
                "short read: asked for {} at offset 0x{:x}, got {}",
                buf.len(),
                offset,
                done
            )));
        }
        Ok(())
    }

    /// Read at most `buf.len()` bytes; a short count means EOF.  Used
    /// for the header prefix whose real size is not yet known.
    pub fn read_at_most(&self, offset: u64, buf: &mut [u8]) -> Qcow2Result<usize> {
        log::trace!("read_at_most off {:x} len {}", offset, buf.len());
        self.io.read_to(offset, buf)
    }

    pub fn write_all(&self, offset: u64, buf: &[u8]) -> Qcow2Result<()> {
        log::trace!("write_all off {:x} len {}", offset, buf.len());

        let end = offset + buf.len() as u64;
        if end > self.length.get() && !self.allow_beyond_eof {
            return Err(Qcow2Error::io(format!(
                "write beyond end of file: end 0x{:x} length 0x{:x}",
                end,
                self.length.get()
            )));
        }

        self.io.write_from(offset, buf)?;
        if end > self.length.get() {
            self.length.set(end);
        }
        Ok(())
    }

    /// Write `len` zero bytes at `offset`.
    pub fn zero_fill(&self, offset: u64, len: usize) -> Qcow2Result<()> {
        log::trace!("zero_fill off {:x} len {}", offset, len);

        let zeros = vec![0u8; std::cmp::min(len, ZERO_CHUNK)];
        let mut done = 0;
        while done < len {
            let chunk = std::cmp::min(len - done, zeros.len());
            self.write_all(offset + done as u64, &zeros[..chunk])?;
            done += chunk;
        }
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Qcow2Result<()> {
        log::trace!("truncate size {:x}", size);
        self.io.truncate(size)?;
        self.length.set(size);
        Ok(())
    }

    pub fn fallocate(&self, offset: u64, len: usize) -> Qcow2Result<()> {
        log::trace!("fallocate off {:x} len {}", offset, len);
        self.io.fallocate(offset, len)?;
        let end = offset + len as u64;
        if end > self.length.get() {
            self.length.set(end);
        }
        Ok(())
    }

    pub fn flush(&self) -> Qcow2Result<()> {
        log::trace!("flush");
        self.io.fsync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Qcow2ErrorKind;
    use crate::sync_io::Qcow2IoSync;

    fn temp_image_file(allow_beyond_eof: bool) -> (tempfile::NamedTempFile, Qcow2ImageFile<Qcow2IoSync>) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let io = Qcow2IoSync::new(tmp.path(), false).unwrap();
        let file = Qcow2ImageFile::new(io, allow_beyond_eof).unwrap();
        (tmp, file)
    }

    #[test]
    fn test_read_exact_short() {
        let (_tmp, file) = temp_image_file(true);
        file.write_all(0, &[1u8; 100]).unwrap();

        let mut buf = [0u8; 200];
        let err = file.read_exact(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::ShortRead);
    }

    #[test]
    fn test_write_beyond_eof_gate() {
        let (_tmp, file) = temp_image_file(false);
        let err = file.write_all(4096, &[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Io);

        let (_tmp, file) = temp_image_file(true);
        file.write_all(4096, &[0u8; 16]).unwrap();
        assert_eq!(file.length(), 4096 + 16);
    }

    #[test]
    fn test_zero_fill() {
        let (_tmp, file) = temp_image_file(true);
        file.write_all(0, &[0xffu8; 1024]).unwrap();
        file.zero_fill(256, 512).unwrap();

        let mut buf = [0u8; 1024];
        file.read_exact(0, &mut buf).unwrap();
        assert!(buf[..256].iter().all(|b| *b == 0xff));
        assert!(buf[256..768].iter().all(|b| *b == 0));
        assert!(buf[768..].iter().all(|b| *b == 0xff));
    }
}
