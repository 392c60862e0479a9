use crate::error::{Qcow2Error, Qcow2Result};
use crate::file::Qcow2ImageFile;
use crate::helpers::{div_round_up, IntAlignment};
use crate::meta::{
    Qcow2FeatureType, Qcow2Header, Qcow2HeaderExtension, Qcow2RawHeader, RefBlock, RefTable,
    RefTableEntry, Table, BLOCK_SIZE,
};
use crate::sync_io::Qcow2IoSync;
use std::path::Path;

pub const DEFAULT_CLUSTER_SIZE: usize = 65536;
pub const DEFAULT_REFCOUNT_BITS: u32 = 16;

/// Policy for reserving host bytes at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qcow2PreallocMode {
    /// No preallocation beyond the metadata skeleton.
    #[default]
    Off,
    /// Metadata skeleton only; data clusters stay sparse.
    Metadata,
    /// Reserve host blocks for the full virtual size.
    Falloc,
    /// Reserve and zero-fill the full virtual size.
    Full,
}

/// Options for creating a new qcow2 image, qemu-img style.
#[derive(Debug, Clone)]
pub struct Qcow2CreateOptions {
    /// Virtual disk size in bytes; rounded up to a 512-byte multiple.
    pub size: u64,

    /// Cluster size in bytes; must be a power of two between 512 and
    /// 2M.
    pub cluster_size: usize,

    /// Compatibility level: "0.10" writes a version 2 image, "1.1"
    /// (the default) a version 3 image.
    pub compat: String,

    /// File name of a base image.  The header records the name; the
    /// parent is not opened.
    pub backing_file: Option<String>,

    /// Image format of the base image.
    pub backing_format: Option<String>,

    /// Record 128-bit AES-CBC encryption in the header.  The core
    /// neither encrypts nor decrypts payload.
    pub encryption: bool,

    pub preallocation: Qcow2PreallocMode,

    /// Postpone refcount updates; requires compat "1.1".
    pub lazy_refcounts: bool,

    /// Width of a refcount entry in bits; a power of two up to 64.
    pub refcount_bits: u32,

    /// Turn off copy-on-write of the image file on btrfs.  Accepted
    /// and ignored; no effect on any file system here.
    pub nocow: bool,
}

impl Qcow2CreateOptions {
    pub fn new(size: u64) -> Self {
        Qcow2CreateOptions {
            size,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            compat: "1.1".to_string(),
            backing_file: None,
            backing_format: None,
            encryption: false,
            preallocation: Qcow2PreallocMode::default(),
            lazy_refcounts: false,
            refcount_bits: DEFAULT_REFCOUNT_BITS,
            nocow: false,
        }
    }
}

/// Host layout of a freshly created image: the metadata skeleton and,
/// for falloc/full, the reserved total.
#[derive(Debug)]
pub(crate) struct Qcow2Layout {
    pub(crate) version: u32,
    pub(crate) cluster_bits: u32,
    pub(crate) refcount_order: u32,
    pub(crate) virtual_size: u64,

    pub(crate) l1_entries: u32,
    pub(crate) l1_clusters: usize,
    pub(crate) refblock_clusters: usize,

    /// header + reftable + refblocks + L1, in clusters
    pub(crate) meta_clusters: usize,

    /// file bytes to reserve for falloc/full
    pub(crate) prealloc_bytes: Option<u64>,
}

impl Qcow2Layout {
    pub(crate) fn cluster_size(&self) -> usize {
        1usize << self.cluster_bits
    }

    pub(crate) fn reftable_offset(&self) -> u64 {
        self.cluster_size() as u64
    }

    pub(crate) fn refblock_offset(&self, index: usize) -> u64 {
        ((2 + index) << self.cluster_bits) as u64
    }

    pub(crate) fn l1_offset(&self) -> u64 {
        ((2 + self.refblock_clusters) << self.cluster_bits) as u64
    }

    pub(crate) fn meta_bytes(&self) -> u64 {
        (self.meta_clusters << self.cluster_bits) as u64
    }
}

fn ctz(val: u64) -> u32 {
    val.trailing_zeros()
}

/// Validate the options and compute the metadata layout.
pub(crate) fn plan(opts: &Qcow2CreateOptions) -> Qcow2Result<Qcow2Layout> {
    let size = opts.size.align_up(BLOCK_SIZE as u64).ok_or_else(|| {
        Qcow2Error::invalid("image size is too large")
    })?;

    let version = match opts.compat.as_str() {
        "0.10" => 2,
        "1.1" | "" => 3,
        other => {
            return Err(Qcow2Error::invalid(format!(
                "Invalid compatibility level: '{}'",
                other
            )))
        }
    };

    if opts.backing_file.is_some() && opts.preallocation != Qcow2PreallocMode::Off {
        return Err(Qcow2Error::invalid(
            "Backing file and preallocation cannot be used at the same time",
        ));
    }

    if opts.lazy_refcounts && version < 3 {
        return Err(Qcow2Error::invalid(
            "Lazy refcounts only supported with compatibility level 1.1 and above",
        ));
    }

    if opts.refcount_bits == 0
        || !opts.refcount_bits.is_power_of_two()
        || opts.refcount_bits > 64
    {
        return Err(Qcow2Error::invalid(
            "Refcount width must be a power of two and may not exceed 64 bits",
        ));
    }
    let refcount_order = ctz(opts.refcount_bits as u64);

    if !opts.cluster_size.is_power_of_two()
        || (opts.cluster_size as u64) < (1 << Qcow2Header::MIN_CLUSTER_BITS)
        || (opts.cluster_size as u64) > Qcow2Header::MAX_CLUSTER_SIZE
    {
        return Err(Qcow2Error::invalid(
            "Cluster size must be a power of two between 512 and 2M",
        ));
    }
    let cluster_bits = ctz(opts.cluster_size as u64);
    let cluster_size = opts.cluster_size as u64;

    let l2_entries = cluster_size / 8;
    let l1_entries = div_round_up(size, cluster_size * l2_entries);
    if l1_entries * 8 > Qcow2Header::MAX_L1_SIZE {
        return Err(Qcow2Error::invalid(
            "The image size is too large for this cluster size",
        ));
    }
    let l1_clusters = std::cmp::max(div_round_up(l1_entries * 8, cluster_size), 1) as usize;

    // every metadata cluster is refcounted, the refblocks included, so
    // the refblock count is a (quickly converging) fixpoint
    let refblock_entries = (cluster_size * 8) >> refcount_order;
    let mut refblock_clusters = 1usize;
    loop {
        let meta_clusters = 2 + refblock_clusters + l1_clusters;
        let needed = div_round_up(meta_clusters as u64, refblock_entries) as usize;
        if needed <= refblock_clusters {
            break;
        }
        refblock_clusters = needed;
    }

    // the initial refcount table is a single cluster
    if refblock_clusters as u64 > cluster_size / 8 {
        return Err(Qcow2Error::unsupported(
            "Too many initial refcount blocks -- try increasing the cluster size",
        ));
    }

    let meta_clusters = 2 + refblock_clusters + l1_clusters;

    let prealloc_bytes = match opts.preallocation {
        Qcow2PreallocMode::Falloc | Qcow2PreallocMode::Full => Some(prealloc_file_size(
            size,
            cluster_size,
            refcount_order,
        )),
        _ => None,
    };

    Ok(Qcow2Layout {
        version,
        cluster_bits,
        refcount_order,
        virtual_size: size,
        l1_entries: l1_entries as u32,
        l1_clusters,
        refblock_clusters,
        meta_clusters,
        prealloc_bytes,
    })
}

/// File size to reserve when fully preallocating: the aligned virtual
/// size plus all metadata an image of that size can need.
///
/// The calculation does not need to be exact; if it is a bit off,
/// either some bytes are leaked or the file grows a little later, as
/// long as the bulk is reserved here.
fn prealloc_file_size(virtual_size: u64, cluster_size: u64, refcount_order: u32) -> u64 {
    let aligned_total = virtual_size.align_up(cluster_size).unwrap();
    let rces = (1u64 << refcount_order) as f64 / 8.0;
    let refblock_bits = ctz(cluster_size) + 3 - refcount_order;
    let refblock_size = 1u64 << refblock_bits;

    // header, then L2 tables, then the L1 table
    let mut meta_size = cluster_size as f64;

    let nl2e = div_round_up(aligned_total, cluster_size)
        .align_up(cluster_size / 8)
        .unwrap();
    meta_size += (nl2e * 8) as f64;

    let nl1e = div_round_up(nl2e * 8, cluster_size)
        .align_up(cluster_size / 8)
        .unwrap();
    meta_size += (nl1e * 8) as f64;

    // total refcount block entries.  Note: every host cluster is
    // refcounted, including metadata (even refcount blocks are
    // recursively included).  Let:
    //   a = total_size (the guest disk size)
    //   m = meta size not including refcount blocks and tables
    //   c = cluster size
    //   y1 = number of refcount block entries
    //   y2 = meta size including everything
    //   rces = refcount entry size in bytes
    // then,
    //   y1 = (y2 + a) / c
    //   y2 = y1 * rces + y1 * rces * 8 / c + m
    // and solving for y1:
    //   y1 = (a + m + c) / (c - rces - rces * 8 / c)
    let nrefblocke = (aligned_total as f64 + meta_size + cluster_size as f64)
        / (cluster_size as f64 - rces - rces * 8.0 / cluster_size as f64);
    meta_size +=
        div_round_up(nrefblocke.ceil() as u64, refblock_size) as f64 * cluster_size as f64;

    // refcount table
    let nreftablee = div_round_up(nrefblocke.ceil() as u64, refblock_size)
        .align_up(cluster_size / 8)
        .unwrap();
    meta_size += (nreftablee * 8) as f64;

    aligned_total + meta_size as u64
}

/// Create a new qcow2 image file at `path`.
///
/// The initial file holds the header (cluster 0), the refcount table
/// (cluster 1), the refcount block(s) and the zeroed L1 table; all
/// metadata clusters carry refcount 1.  A failure after the file has
/// been created leaves a partial file behind for the caller to
/// discard.
pub fn qcow2_create(path: &Path, opts: &Qcow2CreateOptions) -> Qcow2Result<()> {
    let layout = plan(opts)?;
    let cluster_size = layout.cluster_size();

    if opts.nocow {
        log::debug!("nocow requested; no effect on this host");
    }

    log::info!(
        "create {:?}: size {} cluster_bits {} version {} meta clusters {}",
        path,
        layout.virtual_size,
        layout.cluster_bits,
        layout.version,
        layout.meta_clusters
    );

    let io = Qcow2IoSync::create(path)?;
    let file = Qcow2ImageFile::new(io, true)?;

    // header
    let raw = Qcow2RawHeader {
        magic: Qcow2Header::QCOW2_MAGIC,
        version: layout.version,
        cluster_bits: layout.cluster_bits,
        size: layout.virtual_size,
        crypt_method: opts.encryption as u32,
        l1_size: layout.l1_entries,
        l1_table_offset: layout.l1_offset(),
        refcount_table_offset: layout.reftable_offset(),
        refcount_table_clusters: 1,
        compatible_features: if opts.lazy_refcounts {
            Qcow2Header::COMPAT_LAZY_REFCOUNTS
        } else {
            0
        },
        refcount_order: layout.refcount_order,
        ..Default::default()
    };

    let mut extensions = Vec::new();
    if let Some(fmt) = &opts.backing_format {
        extensions.push(Qcow2HeaderExtension::BackingFileFormat(fmt.clone()));
    }
    if layout.version >= 3 {
        extensions.push(Qcow2HeaderExtension::FeatureNameTable(vec![
            (Qcow2FeatureType::Incompatible, 0, "dirty bit".to_string()),
            (Qcow2FeatureType::Incompatible, 1, "corrupt bit".to_string()),
            (Qcow2FeatureType::Compatible, 0, "lazy refcounts".to_string()),
        ]));
    }

    let mut header =
        Qcow2Header::from_parts(raw, opts.backing_file.clone(), extensions);
    let header_buf = header.serialize_to_buf()?;
    file.write_all(0, &header_buf)?;
    if header_buf.len() < cluster_size {
        file.zero_fill(header_buf.len() as u64, cluster_size - header_buf.len())?;
    }

    // refcount table: one entry per initial refcount block
    let mut reftable = RefTable::new(Some(layout.reftable_offset()), cluster_size);
    for i in 0..layout.refblock_clusters {
        reftable.set(i, RefTableEntry(layout.refblock_offset(i)));
    }
    file.write_all(layout.reftable_offset(), reftable.as_bytes())?;

    // refcount blocks: every metadata cluster has refcount 1
    let refblock_entries = (cluster_size * 8) >> layout.refcount_order;
    for block in 0..layout.refblock_clusters {
        let mut refblock = RefBlock::new(
            layout.refcount_order as u8,
            cluster_size,
            Some(layout.refblock_offset(block)),
        );

        let first = block * refblock_entries;
        let past = std::cmp::min((block + 1) * refblock_entries, layout.meta_clusters);
        for cluster in first..past {
            refblock.increment(cluster - first)?;
        }

        file.write_all(layout.refblock_offset(block), refblock.as_bytes())?;
    }

    // zeroed L1 table
    file.zero_fill(layout.l1_offset(), layout.l1_clusters * cluster_size)?;

    match opts.preallocation {
        Qcow2PreallocMode::Off | Qcow2PreallocMode::Metadata => {}
        Qcow2PreallocMode::Falloc => {
            let total = layout.prealloc_bytes.unwrap();
            file.fallocate(0, total as usize)?;
        }
        Qcow2PreallocMode::Full => {
            let total = layout.prealloc_bytes.unwrap();
            let meta_end = layout.meta_bytes();
            if total > meta_end {
                file.zero_fill(meta_end, (total - meta_end) as usize)?;
            }
        }
    }

    file.flush()?;
    Ok(())
}
