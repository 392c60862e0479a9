use crate::error::{Qcow2Error, Qcow2Result};
use crate::ops::Qcow2IoOps;
use nix::fcntl::{fallocate, FallocateFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// File-backed [`Qcow2IoOps`] using positioned syscalls.
#[derive(Debug)]
pub struct Qcow2IoSync {
    file: File,
    fd: i32,
}

impl Qcow2IoSync {
    pub fn new(path: &Path, read_only: bool) -> Qcow2Result<Qcow2IoSync> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| Qcow2Error::from(e).prepend("open image"))?;

        let fd = file.as_raw_fd();
        Ok(Qcow2IoSync { file, fd })
    }

    pub fn create(path: &Path) -> Qcow2Result<Qcow2IoSync> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Qcow2Error::from(e).prepend("create image"))?;

        let fd = file.as_raw_fd();
        Ok(Qcow2IoSync { file, fd })
    }
}

impl Qcow2IoOps for Qcow2IoSync {
    fn get_length(&self) -> Qcow2Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_to(&self, offset: u64, buf: &mut [u8]) -> Qcow2Result<usize> {
        let mut done = 0;

        while done < buf.len() {
            let res = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as i64,
                )
            };

            match res {
                r if r < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(Qcow2Error::from(err).prepend("pread"));
                }
                0 => break,
                r => done += r as usize,
            }
        }

        Ok(done)
    }

    fn write_from(&self, offset: u64, buf: &[u8]) -> Qcow2Result<()> {
        let mut done = 0;

        while done < buf.len() {
            let res = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    (offset + done as u64) as i64,
                )
            };

            match res {
                r if r < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(Qcow2Error::from(err).prepend("pwrite"));
                }
                0 => return Err(Qcow2Error::io("pwrite returned zero")),
                r => done += r as usize,
            }
        }

        Ok(())
    }

    fn truncate(&self, size: u64) -> Qcow2Result<()> {
        nix::unistd::ftruncate(self.fd, size as i64)?;
        Ok(())
    }

    fn fallocate(&self, offset: u64, len: usize) -> Qcow2Result<()> {
        fallocate(
            self.fd,
            FallocateFlags::empty(),
            offset as i64,
            len as i64,
        )?;
        Ok(())
    }

    fn fsync(&self) -> Qcow2Result<()> {
        nix::unistd::fsync(self.fd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Qcow2IoOps;

    #[test]
    fn test_read_write_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let io = Qcow2IoSync::new(tmp.path(), false).unwrap();

        io.write_from(4096, b"qcow2 sync io").unwrap();

        let mut buf = vec![0u8; 13];
        let n = io.read_to(4096, &mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"qcow2 sync io");

        assert_eq!(io.get_length().unwrap(), 4096 + 13);
    }

    #[test]
    fn test_short_read_at_eof() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let io = Qcow2IoSync::new(tmp.path(), false).unwrap();

        io.write_from(0, &[0xau8; 100]).unwrap();

        let mut buf = vec![0u8; 200];
        let n = io.read_to(0, &mut buf).unwrap();
        assert_eq!(n, 100);
    }

    #[test]
    fn test_truncate() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let io = Qcow2IoSync::new(tmp.path(), false).unwrap();

        io.truncate(65536).unwrap();
        assert_eq!(io.get_length().unwrap(), 65536);

        io.truncate(512).unwrap();
        assert_eq!(io.get_length().unwrap(), 512);
    }

    #[test]
    fn test_fallocate_extends() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let io = Qcow2IoSync::new(tmp.path(), false).unwrap();

        io.fallocate(0, 65536).unwrap();
        assert_eq!(io.get_length().unwrap(), 65536);
    }
}
