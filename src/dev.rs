use crate::create::{qcow2_create, Qcow2CreateOptions};
use crate::error::{Qcow2Error, Qcow2ErrorKind, Qcow2Result};
use crate::file::Qcow2ImageFile;
use crate::mapping::ClusterMap;
use crate::meta::{Mapping, Qcow2Header, BLOCK_SIZE};
use crate::ops::Qcow2IoOps;
use crate::refcount::RefcountEngine;
use crate::sync_io::Qcow2IoSync;
use std::cell::{Cell, Ref, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// 4K is usually enough for holding a generic qcow2 header
const DEF_HEADER_SIZE: usize = 4096;

/// 64K is big enough to hold any kind of qcow2 header
const MAX_HEADER_SIZE: usize = 65536;

/// Must be at least 2 to cover copy-on-write.
const MIN_L2_CACHE_SIZE: usize = 2; // clusters

/// Must be at least 4 to cover all cases of refcount table growth.
const MIN_REFCOUNT_CACHE_SIZE: usize = 4; // clusters

const DEFAULT_L2_CACHE_BYTE_SIZE: usize = 1048576; // bytes

/// The refblock cache needs only a fourth of the L2 cache size to
/// cover as many clusters.
const DEFAULT_L2_REFCOUNT_SIZE_RATIO: usize = 4;

/// Derived constants of an open image, all computable from the header
/// once and read-only afterwards.
#[derive(Debug)]
pub struct Qcow2Info {
    pub cluster_shift: u8,
    pub l2_bits: u8,
    pub rb_index_shift: u8,

    pub in_cluster_offset_mask: usize,
    pub l2_index_mask: usize,
    pub rb_index_mask: usize,

    /// Compressed cluster descriptor split.
    pub csize_shift: u32,
    pub csize_mask: u64,
    pub cluster_offset_mask: u64,

    pub l2_cache_cnt: usize,
    pub rb_cache_cnt: usize,

    version: u32,
    refcount_order: u8,
    refcount_bits: u32,
    refcount_max: u64,
    flags: u16,
}

impl Qcow2Info {
    const READ_ONLY: u16 = 1 << 0;
    const HAS_BACK_FILE: u16 = 1 << 1;
    const LAZY_REFCOUNTS: u16 = 1 << 2;

    pub fn new(h: &Qcow2Header, p: &Qcow2DevParams) -> Qcow2Result<Qcow2Info> {
        let ro = p.read_only;

        let cluster_shift: u8 = h.cluster_bits().try_into()?;
        let cluster_size: usize = 1usize
            .checked_shl(cluster_shift.into())
            .ok_or_else(|| Qcow2Error::invalid(format!("cluster_bits={} is too large", cluster_shift)))?;
        let refcount_order: u8 = h.refcount_order().try_into()?;
        let refcount_bits = 1u32 << refcount_order;
        let refcount_max = match refcount_order {
            6 => u64::MAX,
            _ => (1u64 << refcount_bits) - 1,
        };

        let l2_entries = cluster_size / std::mem::size_of::<u64>();
        let rb_entries = (cluster_size * 8) >> refcount_order;

        let l2_cache_cnt = p.l2_cache_entries.unwrap_or_else(|| {
            std::cmp::max(DEFAULT_L2_CACHE_BYTE_SIZE / cluster_size, MIN_L2_CACHE_SIZE)
        });
        let rb_cache_cnt = p.rb_cache_entries.unwrap_or_else(|| {
            std::cmp::max(
                l2_cache_cnt / DEFAULT_L2_REFCOUNT_SIZE_RATIO,
                MIN_REFCOUNT_CACHE_SIZE,
            )
        });

        Ok(Qcow2Info {
            cluster_shift,
            l2_bits: cluster_shift - 3,
            rb_index_shift: rb_entries.trailing_zeros().try_into()?,
            in_cluster_offset_mask: cluster_size - 1,
            l2_index_mask: l2_entries - 1,
            rb_index_mask: rb_entries - 1,
            csize_shift: 62 - (cluster_shift as u32 - 8),
            csize_mask: (1u64 << (cluster_shift - 8)) - 1,
            cluster_offset_mask: (1u64 << (62 - (cluster_shift as u32 - 8))) - 1,
            l2_cache_cnt,
            rb_cache_cnt,
            version: h.version(),
            refcount_order,
            refcount_bits,
            refcount_max,
            flags: if ro { Qcow2Info::READ_ONLY } else { 0 }
                | if h.backing_filename().is_some() {
                    Qcow2Info::HAS_BACK_FILE
                } else {
                    0
                }
                | if h.has_lazy_refcounts() && !ro {
                    Qcow2Info::LAZY_REFCOUNTS
                } else {
                    0
                },
        })
    }

    #[inline(always)]
    pub fn cluster_bits(&self) -> usize {
        self.cluster_shift as usize
    }

    #[inline(always)]
    pub fn cluster_size(&self) -> usize {
        1usize << self.cluster_shift
    }

    #[inline(always)]
    pub fn in_cluster_offset(&self, offset: u64) -> usize {
        offset as usize & self.in_cluster_offset_mask
    }

    #[inline(always)]
    pub fn l2_entries(&self) -> usize {
        1usize << self.l2_bits
    }

    #[inline(always)]
    pub fn rb_entries(&self) -> usize {
        1usize << self.rb_index_shift
    }

    #[inline(always)]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline(always)]
    pub fn refcount_order(&self) -> u8 {
        self.refcount_order
    }

    #[inline(always)]
    pub fn refcount_bits(&self) -> u32 {
        self.refcount_bits
    }

    #[inline(always)]
    pub fn refcount_max(&self) -> u64 {
        self.refcount_max
    }

    #[inline(always)]
    pub fn is_read_only(&self) -> bool {
        self.flags & Qcow2Info::READ_ONLY != 0
    }

    #[inline(always)]
    pub fn has_back_file(&self) -> bool {
        self.flags & Qcow2Info::HAS_BACK_FILE != 0
    }

    #[inline(always)]
    pub fn use_lazy_refcounts(&self) -> bool {
        self.flags & Qcow2Info::LAZY_REFCOUNTS != 0
    }
}

#[cfg(test)]
impl Qcow2Info {
    pub(crate) fn for_test(cluster_bits: usize, refcount_order: u8) -> Self {
        let cluster_size = 1usize << cluster_bits;
        let rb_entries = (cluster_size * 8) >> refcount_order;
        let refcount_bits = 1u32 << refcount_order;

        Qcow2Info {
            cluster_shift: cluster_bits as u8,
            l2_bits: cluster_bits as u8 - 3,
            rb_index_shift: rb_entries.trailing_zeros() as u8,
            in_cluster_offset_mask: cluster_size - 1,
            l2_index_mask: cluster_size / 8 - 1,
            rb_index_mask: rb_entries - 1,
            csize_shift: 62 - (cluster_bits as u32 - 8),
            csize_mask: (1u64 << (cluster_bits - 8)) - 1,
            cluster_offset_mask: (1u64 << (62 - (cluster_bits as u32 - 8))) - 1,
            l2_cache_cnt: MIN_L2_CACHE_SIZE,
            rb_cache_cnt: MIN_REFCOUNT_CACHE_SIZE,
            version: 3,
            refcount_order,
            refcount_bits,
            refcount_max: match refcount_order {
                6 => u64::MAX,
                _ => (1u64 << refcount_bits) - 1,
            },
            flags: 0,
        }
    }
}

/// How an image is opened.
#[derive(Debug, Clone, Default)]
pub struct Qcow2DevParams {
    pub read_only: bool,
    /// Override the L2 table cache size, in cached tables.
    pub l2_cache_entries: Option<usize>,
    /// Override the refcount block cache size, in cached blocks.
    pub rb_cache_entries: Option<usize>,
}

impl Qcow2DevParams {
    pub fn new(read_only: bool) -> Self {
        Qcow2DevParams {
            read_only,
            l2_cache_entries: None,
            rb_cache_entries: None,
        }
    }
}

/// An open qcow2 image: the decoded header, the derived constants and
/// the cluster-map and refcount engines operating on one image file.
///
/// A `Qcow2Dev` is single-writer and not safe to share across
/// threads; callers multiplexing several images use one device per
/// image.
pub struct Qcow2Dev<T> {
    path: PathBuf,
    file: Rc<Qcow2ImageFile<T>>,
    header: Rc<RefCell<Qcow2Header>>,
    info: Rc<Qcow2Info>,

    refcounts: RefCell<RefcountEngine<T>>,
    mapping: RefCell<ClusterMap<T>>,

    /// The header dirty bit was written at open (lazy refcounts) and
    /// must be cleared on clean close.
    dirty_bit_set: Cell<bool>,
}

impl<T> std::fmt::Debug for Qcow2Dev<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Image path {:?}\ninfo {:?}", &self.path, &self.info)
    }
}

fn read_header_buf<T: Qcow2IoOps>(io: &T) -> Qcow2Result<Qcow2Header> {
    let mut buf = vec![0u8; DEF_HEADER_SIZE];
    let _ = io.read_to(0, &mut buf)?;

    match Qcow2Header::from_buf(&buf) {
        Ok(h) => Ok(h),
        Err(_) => {
            // the extension chain may extend past the first read
            let mut buf = vec![0u8; MAX_HEADER_SIZE];
            let _ = io.read_to(0, &mut buf)?;
            Qcow2Header::from_buf(&buf)
        }
    }
}

impl<T: Qcow2IoOps> Qcow2Dev<T> {
    pub fn new(
        path: &Path,
        header: Qcow2Header,
        params: &Qcow2DevParams,
        io: T,
    ) -> Qcow2Result<Self> {
        let info = Qcow2Info::new(&header, params)?;

        if header.is_corrupt() && !params.read_only {
            return Err(Qcow2Error::corrupt(
                "image is marked corrupt; open it read-only",
            ));
        }
        if header.is_dirty() && !params.read_only {
            return Err(Qcow2Error::unsupported(
                "image needs a refcount repair before it can be opened read-write",
            ));
        }

        log::info!(
            "open {:?}: size {} cluster_bits {} version {} l2 cache {} rb cache {}",
            path,
            header.size(),
            header.cluster_bits(),
            header.version(),
            info.l2_cache_cnt,
            info.rb_cache_cnt,
        );

        let file = Rc::new(Qcow2ImageFile::new(io, !params.read_only)?);
        let header = Rc::new(RefCell::new(header));
        let info = Rc::new(info);

        Ok(Qcow2Dev {
            path: path.to_path_buf(),
            refcounts: RefCell::new(RefcountEngine::new(
                Rc::clone(&file),
                Rc::clone(&header),
                Rc::clone(&info),
            )),
            mapping: RefCell::new(ClusterMap::new(
                Rc::clone(&file),
                Rc::clone(&header),
                Rc::clone(&info),
            )),
            file,
            header,
            info,
            dirty_bit_set: Cell::new(false),
        })
    }

    /// Open an image over an already-constructed I/O backend.
    pub fn with_io(path: &Path, io: T, params: &Qcow2DevParams) -> Qcow2Result<Self> {
        let header = read_header_buf(&io)?;
        let dev = Self::new(path, header, params, io)?;
        dev.post_open()?;
        Ok(dev)
    }

    /// Read-write open fixups: unknown autoclear bits are cleared and,
    /// under lazy refcounts, the dirty bit is set until clean close.
    fn post_open(&self) -> Qcow2Result<()> {
        if self.info.is_read_only() {
            return Ok(());
        }

        let mut rewrite = false;
        {
            let mut h = self.header.borrow_mut();

            if h.autoclear_features() != 0 {
                log::info!(
                    "clearing unknown autoclear features {:x}",
                    h.autoclear_features()
                );
                h.set_autoclear_features(0);
                rewrite = true;
            }

            if self.info.use_lazy_refcounts() {
                h.set_dirty_flag(true);
                self.dirty_bit_set.set(true);
                rewrite = true;
            }
        }

        if rewrite {
            self.write_header()?;
            self.file.flush()?;
        }
        Ok(())
    }

    fn write_header(&self) -> Qcow2Result<()> {
        let buf = self.header.borrow_mut().serialize_to_buf()?;
        self.file.write_all(0, &buf)
    }

    /// Best-effort: record detected corruption in the header before
    /// surfacing the error.
    fn mark_corrupt_on(&self, err: Qcow2Error) -> Qcow2Error {
        let kind = err.kind();
        if (kind == Qcow2ErrorKind::Corrupt || kind == Qcow2ErrorKind::RefcountUnderflow)
            && !self.info.is_read_only()
        {
            self.header.borrow_mut().set_corrupt_flag();
            if let Err(werr) = self.write_header() {
                log::error!("failed to set the corrupt bit: {}", werr);
            }
        }
        err
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &Qcow2Info {
        &self.info
    }

    /// Read-only snapshot of the decoded header.
    pub fn header(&self) -> Ref<'_, Qcow2Header> {
        self.header.borrow()
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.borrow().size()
    }

    fn check_guest_offset(&self, virtual_offset: u64) -> Qcow2Result<()> {
        if virtual_offset >= self.virtual_size() {
            return Err(Qcow2Error::invalid(format!(
                "guest offset 0x{:x} is beyond the end of the image",
                virtual_offset
            )));
        }
        Ok(())
    }

    /// Translate a guest offset to its cluster mapping.
    pub fn get_mapping(&self, virtual_offset: u64) -> Qcow2Result<Mapping> {
        self.check_guest_offset(virtual_offset)?;
        self.mapping
            .borrow_mut()
            .lookup(virtual_offset)
            .map_err(|e| self.mark_corrupt_on(e))
    }

    /// Allocate backing for the cluster containing `virtual_offset`
    /// and return its host offset; see [`ClusterMap::allocate`].
    pub fn allocate_cluster(
        &self,
        virtual_offset: u64,
        copy_on_write: bool,
    ) -> Qcow2Result<u64> {
        if self.info.is_read_only() {
            return Err(Qcow2Error::invalid("image is opened read-only"));
        }
        self.check_guest_offset(virtual_offset)?;

        self.mapping
            .borrow_mut()
            .allocate(&mut self.refcounts.borrow_mut(), virtual_offset, copy_on_write)
            .map_err(|e| self.mark_corrupt_on(e))
    }

    /// Refcount of the host cluster with the given index.
    pub fn refcount(&self, host_cluster_index: u64) -> Qcow2Result<u64> {
        self.refcounts.borrow_mut().get(host_cluster_index)
    }

    /// Grow the virtual disk to `new_virtual_size` bytes.
    pub fn truncate(&self, new_virtual_size: u64) -> Qcow2Result<()> {
        if self.info.is_read_only() {
            return Err(Qcow2Error::invalid("image is opened read-only"));
        }
        if new_virtual_size % BLOCK_SIZE as u64 != 0 {
            return Err(Qcow2Error::invalid("The new size must be a multiple of 512"));
        }
        if self.header.borrow().nb_snapshots() != 0 {
            return Err(Qcow2Error::unsupported(
                "Can't resize an image which has snapshots",
            ));
        }

        let old_size = self.virtual_size();
        if new_virtual_size < old_size {
            return Err(Qcow2Error::unsupported(
                "qcow2 doesn't support shrinking images yet",
            ));
        }
        if new_virtual_size == old_size {
            return Ok(());
        }

        let new_l1_size = ClusterMap::<T>::l1_entries_for_size(&self.info, new_virtual_size);
        self.mapping
            .borrow_mut()
            .grow_l1(&mut self.refcounts.borrow_mut(), new_l1_size)
            .map_err(|e| self.mark_corrupt_on(e))?;

        {
            let mut h = self.header.borrow_mut();
            h.set_size(new_virtual_size);
            let buf = h.serialize_to_buf()?;
            if let Err(err) = self.file.write_all(0, &buf) {
                h.set_size(old_size);
                return Err(err);
            }
        }

        log::info!("truncate: {} -> {}", old_size, new_virtual_size);
        Ok(())
    }

    /// Write all dirty metadata: refcounts first, mapping tables
    /// after, so no pointer can reach the disk before the refcount of
    /// its referent.
    pub fn flush_meta(&self) -> Qcow2Result<()> {
        self.refcounts.borrow_mut().flush()?;
        self.mapping.borrow_mut().flush()?;
        Ok(())
    }

    /// Flush metadata and data to stable storage.
    pub fn flush(&self) -> Qcow2Result<()> {
        self.flush_meta()?;
        self.file.flush()
    }

    /// Flush everything, clear the dirty bit under lazy refcounts and
    /// sync the header.
    pub fn close(self) -> Qcow2Result<()> {
        if self.info.is_read_only() {
            return Ok(());
        }

        self.flush()?;

        if self.dirty_bit_set.get() {
            self.header.borrow_mut().set_dirty_flag(false);
            self.write_header()?;
            self.file.flush()?;
            self.dirty_bit_set.set(false);
        }

        log::info!("close {:?}", self.path);
        Ok(())
    }
}

impl Qcow2Dev<Qcow2IoSync> {
    /// Open the image file at `path`.
    pub fn open(path: &Path, params: &Qcow2DevParams) -> Qcow2Result<Self> {
        let io = Qcow2IoSync::new(path, params.read_only)?;
        Self::with_io(path, io, params)
    }

    /// Create a new image at `path` and open it read-write.
    pub fn create(path: &Path, opts: &Qcow2CreateOptions) -> Qcow2Result<Self> {
        qcow2_create(path, opts)?;
        Self::open(path, &Qcow2DevParams::new(false))
    }
}
