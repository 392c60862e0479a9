use crate::error::Qcow2Result;

/// How the image file is read, written and resized, so that the core
/// can be used with different host I/O backends.
///
/// All calls are synchronous and positioned; the core never seeks.
pub trait Qcow2IoOps {
    /// Current length of the image file in bytes.
    fn get_length(&self) -> Qcow2Result<u64>;

    /// Read up to `buf.len()` bytes at `offset`, returning the number
    /// of bytes read.  A short count means EOF.
    fn read_to(&self, offset: u64, buf: &mut [u8]) -> Qcow2Result<usize>;

    /// Write the whole of `buf` at `offset`.
    fn write_from(&self, offset: u64, buf: &[u8]) -> Qcow2Result<()>;

    /// Extend or shrink the file to `size` bytes.
    fn truncate(&self, size: u64) -> Qcow2Result<()>;

    /// Reserve host blocks for `[offset, offset + len)` without
    /// writing data.
    fn fallocate(&self, offset: u64, len: usize) -> Qcow2Result<()>;

    /// Flush file data and metadata to stable storage.
    fn fsync(&self) -> Qcow2Result<()>;
}
