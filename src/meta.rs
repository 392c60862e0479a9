use crate::codec;
use crate::dev::Qcow2Info;
use crate::error::{Qcow2Error, Qcow2Result};
use crate::helpers::{div_round_up, IntAlignment};
use crate::numerical_enum;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;

/// Granularity of dirty tracking in the top-level tables; metadata
/// writes never go below one host sector.
pub(crate) const BLOCK_SHIFT: u8 = 9;
pub(crate) const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

macro_rules! impl_table_gen_funcs {
    ($field:ident) => {
        #[inline(always)]
        fn as_bytes(&self) -> &[u8] {
            &self.$field
        }

        #[inline(always)]
        fn as_bytes_mut(&mut self) -> &mut [u8] {
            &mut self.$field
        }

        #[inline(always)]
        fn get_offset(&self) -> Option<u64> {
            self.offset
        }

        #[inline(always)]
        fn set_offset(&mut self, offset: Option<u64>) {
            self.offset = offset;
        }
    };
}

macro_rules! impl_table_gen_setter {
    ($entry:ident, $field:ident) => {
        #[inline(always)]
        fn entries(&self) -> usize {
            self.$field.len() / std::mem::size_of::<u64>()
        }

        #[inline(always)]
        fn get(&self, index: usize) -> $entry {
            if index < self.entries() {
                $entry(codec::read_u64(&self.$field, index * 8))
            } else {
                $entry(0)
            }
        }

        #[inline(always)]
        fn set(&mut self, index: usize, entry: $entry) {
            codec::write_u64(&mut self.$field, index * 8, entry.0);
        }
    };
}

macro_rules! impl_top_table_gen_funcs {
    () => {
        #[inline(always)]
        fn set_dirty(&self, idx: usize) {
            let blk_idx = ((idx * 8) >> BLOCK_SHIFT) as u32;
            let mut blkq = self.dirty_blocks.borrow_mut();

            if !blkq.contains(&blk_idx) {
                blkq.push_back(blk_idx);
            }
        }

        #[inline(always)]
        fn pop_dirty_blk_idx(&self) -> Option<u32> {
            self.dirty_blocks.borrow_mut().pop_front()
        }
    };
}

macro_rules! impl_table_traits {
    ($table:ident, $entry:ident, $field:ident) => {
        impl Table for $table {
            type Entry = $entry;

            impl_table_gen_funcs!($field);
            impl_table_gen_setter!($entry, $field);
        }
    };
}

macro_rules! impl_top_table_traits {
    ($table:ident, $entry:ident, $field:ident) => {
        impl Table for $table {
            type Entry = $entry;

            impl_table_gen_funcs!($field);
            impl_table_gen_setter!($entry, $field);
            impl_top_table_gen_funcs!();
        }
    };
}

macro_rules! impl_entry_display_trait {
    ($entry:ident) => {
        impl std::fmt::Display for $entry {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:<16x}", self.into_plain())
            }
        }
    };
}

impl_entry_display_trait!(L1Entry);
impl_entry_display_trait!(L2Entry);
impl_entry_display_trait!(RefTableEntry);

/// The fixed header prefix, encoded big-endian on disk.  Version 2
/// stops after `snapshots_offset` (72 bytes); version 3 carries the
/// feature masks through `header_length` (104 bytes).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub(crate) struct Qcow2RawHeader {
    /// QCOW magic string ("QFI\xfb")
    pub(crate) magic: u32,

    /// Version number (valid values are 2 and 3)
    pub(crate) version: u32,

    /// Offset into the image file at which the backing file name
    /// is stored (NB: The string is not null terminated). 0 if the
    /// image doesn't have a backing file.
    pub(crate) backing_file_offset: u64,

    /// Length of the backing file name in bytes. Must not be
    /// longer than 1023 bytes.
    pub(crate) backing_file_size: u32,

    /// Number of bits used for addressing an offset within a cluster
    /// (1 << cluster_bits is the cluster size). Must be between 9
    /// and 21.
    pub(crate) cluster_bits: u32,

    /// Virtual disk size in bytes.
    pub(crate) size: u64,

    /// 0 for no encryption, 1 for AES encryption
    pub(crate) crypt_method: u32,

    /// Number of entries in the active L1 table
    pub(crate) l1_size: u32,

    /// Offset into the image file at which the active L1 table
    /// starts. Must be aligned to a cluster boundary.
    pub(crate) l1_table_offset: u64,

    /// Offset into the image file at which the refcount table
    /// starts. Must be aligned to a cluster boundary.
    pub(crate) refcount_table_offset: u64,

    /// Number of clusters that the refcount table occupies
    pub(crate) refcount_table_clusters: u32,

    /// Number of snapshots contained in the image
    pub(crate) nb_snapshots: u32,

    /// Offset into the image file at which the snapshot table
    /// starts. Must be aligned to a cluster boundary.
    pub(crate) snapshots_offset: u64,

    // The following fields are only valid for version >= 3
    /// Bitmask of incompatible features. An implementation must
    /// fail to open an image if an unknown bit is set.
    ///
    /// Bit 0: dirty bit. Refcounts may be inconsistent.
    /// Bit 1: corrupt bit. The image must not be written to.
    pub(crate) incompatible_features: u64,

    /// Bitmask of compatible features. Unknown bits may be ignored.
    ///
    /// Bit 0: lazy refcounts.
    pub(crate) compatible_features: u64,

    /// Bitmask of auto-clear features. An implementation may only
    /// write to an image with unknown auto-clear features if it
    /// clears the respective bits first.
    pub(crate) autoclear_features: u64,

    /// Width of a refcount block entry in bits:
    /// refcount_bits = 1 << refcount_order. Always 4 for version 2.
    /// May not exceed 6.
    pub(crate) refcount_order: u32,

    /// Length of the header structure in bytes. 72 for version 2,
    /// at least 104 for version 3.
    pub(crate) header_length: u32,
}

numerical_enum! {
    pub enum Qcow2HeaderExtensionType as u32 {
        End = 0,
        BackingFileFormat = 0xe2792aca,
        FeatureNameTable = 0x6803f857,
        Bitmaps = 0x23852875,
    }
}

numerical_enum! {
    #[derive(Hash)]
    pub enum Qcow2FeatureType as u8 {
        Incompatible = 0,
        Compatible = 1,
        Autoclear = 2,
    }
}

impl Qcow2RawHeader {
    pub(crate) fn serialize_vec(&mut self) -> Qcow2Result<Vec<u8>> {
        self.header_length = match self.version {
            2 => Qcow2Header::V2_HEADER_SIZE as u32,
            _ => Qcow2Header::V3_HEADER_SIZE as u32,
        };

        let bincode = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_big_endian();

        let mut header_buf = bincode.serialize(self)?;
        debug_assert!(header_buf.len() == Qcow2Header::V3_HEADER_SIZE);
        header_buf.truncate(self.header_length as usize);

        Ok(header_buf)
    }
}

#[derive(Default, Deserialize, Serialize)]
struct Qcow2HeaderExtensionHeader {
    /// Type code of the header extension
    extension_type: u32,

    /// Data length
    length: u32,
}

const EXTENSION_HEADER_SIZE: usize = 8;

/// One entry of the feature-name table extension: 48 bytes on disk,
/// the name zero-padded to 46 bytes.
pub type Qcow2FeatureName = (Qcow2FeatureType, u8, String);

const FEATURE_NAME_ENTRY_SIZE: usize = 48;
const FEATURE_NAME_LEN: usize = 46;

#[derive(Debug, Clone, PartialEq)]
pub enum Qcow2HeaderExtension {
    BackingFileFormat(String),
    FeatureNameTable(Vec<Qcow2FeatureName>),
    /// Bitmaps extension; the payload is kept verbatim, the core does
    /// not interpret bitmap directories.
    Bitmaps(Vec<u8>),
    Unknown { extension_type: u32, data: Vec<u8> },
}

impl Qcow2HeaderExtension {
    /// Parse an extension from its type and data.  Unrecognized types
    /// are stored as `Unknown` extensions, encountering the end of
    /// extensions returns `Ok(None)`.
    fn from(ext_type: u32, data: Vec<u8>) -> Qcow2Result<Option<Self>> {
        let ext = if let Ok(ext_type) = Qcow2HeaderExtensionType::try_from(ext_type) {
            match ext_type {
                Qcow2HeaderExtensionType::End => return Ok(None),
                Qcow2HeaderExtensionType::BackingFileFormat => {
                    let fmt = String::from_utf8(data).map_err(|err| {
                        Qcow2Error::corrupt(format!("Invalid backing file format: {}", err))
                    })?;
                    Qcow2HeaderExtension::BackingFileFormat(fmt)
                }
                Qcow2HeaderExtensionType::FeatureNameTable => {
                    let mut feats = Vec::new();
                    for feat in data.chunks_exact(FEATURE_NAME_ENTRY_SIZE) {
                        let feat_type: Qcow2FeatureType = match feat[0].try_into() {
                            Ok(ft) => ft,
                            Err(_) => continue, // skip unrecognized entries
                        };
                        let feat_name = String::from(
                            String::from_utf8_lossy(&feat[2..]).trim_end_matches('\0'),
                        );

                        feats.push((feat_type, feat[1], feat_name));
                    }
                    Qcow2HeaderExtension::FeatureNameTable(feats)
                }
                Qcow2HeaderExtensionType::Bitmaps => Qcow2HeaderExtension::Bitmaps(data),
            }
        } else {
            Qcow2HeaderExtension::Unknown {
                extension_type: ext_type,
                data,
            }
        };

        Ok(Some(ext))
    }

    fn extension_type(&self) -> u32 {
        match self {
            Qcow2HeaderExtension::BackingFileFormat(_) => {
                Qcow2HeaderExtensionType::BackingFileFormat as u32
            }
            Qcow2HeaderExtension::FeatureNameTable(_) => {
                Qcow2HeaderExtensionType::FeatureNameTable as u32
            }
            Qcow2HeaderExtension::Bitmaps(_) => Qcow2HeaderExtensionType::Bitmaps as u32,
            Qcow2HeaderExtension::Unknown {
                extension_type,
                data: _,
            } => *extension_type,
        }
    }

    fn serialize_data(&self) -> Qcow2Result<Vec<u8>> {
        match self {
            Qcow2HeaderExtension::BackingFileFormat(fmt) => Ok(fmt.as_bytes().into()),
            Qcow2HeaderExtension::FeatureNameTable(feats) => {
                let mut result = Vec::new();
                for (feat_type, bit, name) in feats {
                    result.push(*feat_type as u8);
                    result.push(*bit);

                    let mut padded_name = vec![0; FEATURE_NAME_LEN];
                    let name_bytes = name.as_bytes();
                    // Might truncate in the middle of a multibyte character, but getting that
                    // right is complicated and probably not worth it
                    let truncated_len = std::cmp::min(name_bytes.len(), FEATURE_NAME_LEN);
                    padded_name[..truncated_len].copy_from_slice(&name_bytes[..truncated_len]);
                    result.extend_from_slice(&padded_name);
                }
                Ok(result)
            }
            Qcow2HeaderExtension::Bitmaps(data) => Ok(data.clone()),
            Qcow2HeaderExtension::Unknown {
                extension_type: _,
                data,
            } => Ok(data.clone()),
        }
    }
}

/// A guest byte offset split into its table indices.
#[derive(Debug, Clone)]
pub struct SplitGuestOffset(pub u64);

impl SplitGuestOffset {
    #[inline(always)]
    pub fn guest_addr(&self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn l1_index(&self, info: &Qcow2Info) -> usize {
        (self.0 >> (info.cluster_shift + info.l2_bits)) as usize
    }

    #[inline(always)]
    pub fn l2_index(&self, info: &Qcow2Info) -> usize {
        (self.0 >> info.cluster_shift) as usize & info.l2_index_mask
    }

    #[inline(always)]
    pub fn in_cluster_offset(&self, info: &Qcow2Info) -> usize {
        self.0 as usize & info.in_cluster_offset_mask
    }

    /// Guest offset of the start of the containing cluster.
    #[inline(always)]
    pub fn cluster_start(&self, info: &Qcow2Info) -> u64 {
        self.0 & !(info.in_cluster_offset_mask as u64)
    }
}

/// A host byte offset split into refcount-table indices.
#[derive(Debug, Clone)]
pub struct HostCluster(pub u64);

impl HostCluster {
    #[inline(always)]
    pub fn cluster_index(&self, info: &Qcow2Info) -> u64 {
        self.0 >> info.cluster_shift
    }

    #[inline(always)]
    pub fn rt_index(&self, info: &Qcow2Info) -> usize {
        (self.cluster_index(info) >> info.rb_index_shift) as usize
    }

    #[inline(always)]
    pub fn rb_index(&self, info: &Qcow2Info) -> usize {
        self.cluster_index(info) as usize & info.rb_index_mask
    }
}

#[derive(Debug)]
pub struct Qcow2Header {
    raw: Qcow2RawHeader,
    backing_filename: Option<String>,
    extensions: Vec<Qcow2HeaderExtension>,
}

impl Qcow2Header {
    pub const QCOW2_MAGIC: u32 = 0x51_46_49_fb;
    pub const MIN_CLUSTER_BITS: u32 = 9;
    pub const MAX_CLUSTER_BITS: u32 = 21;
    pub const MAX_CLUSTER_SIZE: u64 = 2 << 20;
    pub const MAX_L1_SIZE: u64 = 32 << 20;
    pub const MAX_REFTABLE_SIZE: u64 = 8 << 20;
    pub const MAX_BACKING_NAME_SIZE: u32 = 1023;
    pub const V2_HEADER_SIZE: usize = 72;
    pub const V3_HEADER_SIZE: usize = 104;
    pub const MAX_REFCOUNT_ORDER: u32 = 6;

    pub const INCOMPAT_DIRTY: u64 = 1 << 0;
    pub const INCOMPAT_CORRUPT: u64 = 1 << 1;
    pub const INCOMPAT_MASK: u64 = Self::INCOMPAT_DIRTY | Self::INCOMPAT_CORRUPT;
    pub const COMPAT_LAZY_REFCOUNTS: u64 = 1 << 0;

    pub(crate) fn from_parts(
        raw: Qcow2RawHeader,
        backing_filename: Option<String>,
        extensions: Vec<Qcow2HeaderExtension>,
    ) -> Self {
        Qcow2Header {
            raw,
            backing_filename,
            extensions,
        }
    }

    pub fn from_buf(header_buf: &[u8]) -> Qcow2Result<Self> {
        if header_buf.len() < Self::V2_HEADER_SIZE {
            return Err(Qcow2Error::corrupt("qcow2 header too short"));
        }

        let bincode = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_big_endian();

        // Always decode the long form; a v2 prefix is zero-padded and
        // the surplus fields rewritten below.
        let mut long_buf = [0u8; Self::V3_HEADER_SIZE];
        let got = std::cmp::min(header_buf.len(), Self::V3_HEADER_SIZE);
        long_buf[..got].copy_from_slice(&header_buf[..got]);

        let mut header: Qcow2RawHeader = bincode.deserialize(&long_buf)?;

        if header.magic != Self::QCOW2_MAGIC {
            return Err(Qcow2Error::unsupported("Image is not in qcow2 format"));
        }

        if header.version != 2 && header.version != 3 {
            return Err(Qcow2Error::unsupported("Unsupported qcow2 version"));
        }

        if header.version == 2 {
            // v3 fields are synthesized for the short header
            header.incompatible_features = 0;
            header.compatible_features = 0;
            header.autoclear_features = 0;
            header.refcount_order = 4;
            header.header_length = Self::V2_HEADER_SIZE as u32;
        }

        if header.cluster_bits < Self::MIN_CLUSTER_BITS
            || header.cluster_bits > Self::MAX_CLUSTER_BITS
        {
            return Err(Qcow2Error::invalid(
                "Cluster size must be a power of two between 512 and 2M",
            ));
        }
        let cluster_size = 1u64 << header.cluster_bits;

        if header.version == 3 {
            if (header.header_length as usize) < Self::V3_HEADER_SIZE {
                return Err(Qcow2Error::corrupt("qcow2 header too short"));
            }
            if header.header_length as u64 > cluster_size {
                return Err(Qcow2Error::corrupt("qcow2 header exceeds cluster size"));
            }
        }

        if header.refcount_order > Self::MAX_REFCOUNT_ORDER {
            return Err(Qcow2Error::corrupt(format!(
                "Refcount order {} exceeds {}",
                header.refcount_order,
                Self::MAX_REFCOUNT_ORDER
            )));
        }

        if header.l1_table_offset & (cluster_size - 1) != 0 {
            return Err(Qcow2Error::corrupt(
                "L1 table offset is not cluster-aligned",
            ));
        }
        if header.refcount_table_offset & (cluster_size - 1) != 0 {
            return Err(Qcow2Error::corrupt(
                "Refcount table offset is not cluster-aligned",
            ));
        }

        if header.l1_size as u64 * 8 > Self::MAX_L1_SIZE {
            return Err(Qcow2Error::corrupt("Active L1 table too large"));
        }
        let l2_entries = cluster_size / 8;
        let l1_needed = div_round_up(header.size, cluster_size * l2_entries);
        if (header.l1_size as u64) < l1_needed {
            return Err(Qcow2Error::corrupt("L1 table is too small"));
        }

        if header.refcount_table_clusters as u64 * cluster_size > Self::MAX_REFTABLE_SIZE {
            return Err(Qcow2Error::corrupt("Refcount table too large"));
        }

        let backing_filename = if header.backing_file_offset != 0 {
            let (offset, length) = (header.backing_file_offset, header.backing_file_size);
            if length > Self::MAX_BACKING_NAME_SIZE {
                return Err(Qcow2Error::corrupt(format!(
                    "Backing file name is too long ({}, must not exceed {})",
                    length,
                    Self::MAX_BACKING_NAME_SIZE
                )));
            }

            let end = offset
                .checked_add(length as u64)
                .ok_or_else(|| Qcow2Error::corrupt("Backing file name offset is invalid"))?;
            if end > cluster_size {
                return Err(Qcow2Error::corrupt("Backing file name offset is invalid"));
            }
            if end > header_buf.len() as u64 {
                return Err(Qcow2Error::corrupt("header buffer is too small"));
            }

            let backing_buf = header_buf[offset as usize..end as usize].to_vec();
            Some(String::from_utf8(backing_buf).map_err(|err| {
                Qcow2Error::corrupt(format!("Backing file name is invalid: {}", err))
            })?)
        } else {
            None
        };

        let mut ext_offset: u64 = header.header_length as u64;
        let mut extensions = Vec::<Qcow2HeaderExtension>::new();
        loop {
            let max_len = ext_offset + EXTENSION_HEADER_SIZE as u64;
            if max_len > cluster_size || max_len > header_buf.len() as u64 {
                return Err(Qcow2Error::corrupt(
                    "Header extensions exceed the first cluster or header buffer is too small",
                ));
            }

            let ext_hdr_buf =
                &header_buf[ext_offset as usize..ext_offset as usize + EXTENSION_HEADER_SIZE];
            ext_offset += EXTENSION_HEADER_SIZE as u64;

            let ext_hdr: Qcow2HeaderExtensionHeader = bincode.deserialize(ext_hdr_buf)?;
            let max_len = ext_offset + ext_hdr.length as u64;
            if max_len > cluster_size || max_len > header_buf.len() as u64 {
                return Err(Qcow2Error::corrupt(
                    "Header extensions exceed the first cluster or header buffer is too small",
                ));
            }

            let ext_data = header_buf
                [ext_offset as usize..ext_offset as usize + ext_hdr.length as usize]
                .to_vec();
            ext_offset += (ext_hdr.length as u64).align_up(8u64).unwrap();

            let extension = match Qcow2HeaderExtension::from(ext_hdr.extension_type, ext_data)? {
                Some(ext) => ext,
                None => break,
            };

            extensions.push(extension);
        }

        let header = Qcow2Header {
            raw: header,
            backing_filename,
            extensions,
        };

        let unknown_incompat = header.raw.incompatible_features & !Self::INCOMPAT_MASK;
        if unknown_incompat != 0 {
            let feats = (0..64)
                .filter(|bit| unknown_incompat & (1u64 << bit) != 0)
                .map(|bit| {
                    if let Some(name) = header.feature_name(Qcow2FeatureType::Incompatible, bit) {
                        format!("{} ({})", bit, name)
                    } else {
                        format!("{}", bit)
                    }
                })
                .collect::<Vec<String>>();

            return Err(Qcow2Error::incompatible_feature(format!(
                "Unrecognized incompatible feature(s) {}",
                feats.join(", ")
            )));
        }

        Ok(header)
    }

    pub fn serialize_to_buf(&mut self) -> Qcow2Result<Vec<u8>> {
        let mut header_exts = self.serialize_extensions()?;
        let header_len = match self.raw.version {
            2 => Self::V2_HEADER_SIZE,
            _ => Self::V3_HEADER_SIZE,
        };

        if let Some(backing) = self.backing_filename.as_ref() {
            self.raw.backing_file_offset = (header_len + header_exts.len()).try_into()?;
            self.raw.backing_file_size = backing.as_bytes().len().try_into()?;
        } else {
            self.raw.backing_file_offset = 0;
            self.raw.backing_file_size = 0;
        }

        let mut full_buf = self.raw.serialize_vec()?;
        full_buf.append(&mut header_exts);
        if let Some(backing) = self.backing_filename.as_ref() {
            full_buf.extend_from_slice(backing.as_bytes());
        }

        if full_buf.len() as u64 > 1u64 << self.raw.cluster_bits {
            return Err(Qcow2Error::corrupt("qcow2 header exceeds cluster size"));
        }

        Ok(full_buf)
    }

    fn serialize_extensions(&self) -> Qcow2Result<Vec<u8>> {
        let bincode = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_big_endian();

        let mut result = Vec::new();
        for e in &self.extensions {
            let mut data = e.serialize_data()?;
            let ext_hdr = Qcow2HeaderExtensionHeader {
                extension_type: e.extension_type(),
                length: data.len().try_into()?,
            };
            result.append(&mut bincode.serialize(&ext_hdr)?);
            result.append(&mut data);
            result.resize(result.len().align_up(8usize).unwrap(), 0);
        }

        let end_ext = Qcow2HeaderExtensionHeader {
            extension_type: Qcow2HeaderExtensionType::End as u32,
            length: 0,
        };
        result.append(&mut bincode.serialize(&end_ext)?);
        result.resize(result.len().align_up(8usize).unwrap(), 0);

        Ok(result)
    }

    pub fn version(&self) -> u32 {
        self.raw.version
    }

    pub fn crypt_method(&self) -> u32 {
        self.raw.crypt_method
    }

    pub fn header_length(&self) -> u32 {
        self.raw.header_length
    }

    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.raw.size = size;
    }

    pub fn cluster_bits(&self) -> u32 {
        self.raw.cluster_bits
    }

    pub fn refcount_order(&self) -> u32 {
        self.raw.refcount_order
    }

    pub fn l1_table_offset(&self) -> u64 {
        self.raw.l1_table_offset
    }

    pub fn l1_table_entries(&self) -> usize {
        self.raw.l1_size as usize
    }

    pub(crate) fn set_l1_table(&mut self, offset: u64, entries: usize) -> Qcow2Result<()> {
        self.raw.l1_size = entries.try_into()?;
        self.raw.l1_table_offset = offset;
        Ok(())
    }

    pub fn nb_snapshots(&self) -> u32 {
        self.raw.nb_snapshots
    }

    pub fn snapshots_offset(&self) -> u64 {
        self.raw.snapshots_offset
    }

    pub fn reftable_offset(&self) -> u64 {
        self.raw.refcount_table_offset
    }

    pub fn reftable_clusters(&self) -> usize {
        self.raw.refcount_table_clusters as usize
    }

    pub(crate) fn set_reftable(&mut self, offset: u64, clusters: usize) -> Qcow2Result<()> {
        self.raw.refcount_table_clusters = clusters.try_into()?;
        self.raw.refcount_table_offset = offset;
        Ok(())
    }

    pub fn incompatible_features(&self) -> u64 {
        self.raw.incompatible_features
    }

    pub fn compatible_features(&self) -> u64 {
        self.raw.compatible_features
    }

    pub fn autoclear_features(&self) -> u64 {
        self.raw.autoclear_features
    }

    pub(crate) fn set_autoclear_features(&mut self, features: u64) {
        self.raw.autoclear_features = features;
    }

    pub fn has_lazy_refcounts(&self) -> bool {
        self.raw.compatible_features & Self::COMPAT_LAZY_REFCOUNTS != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.raw.incompatible_features & Self::INCOMPAT_DIRTY != 0
    }

    pub(crate) fn set_dirty_flag(&mut self, dirty: bool) {
        if dirty {
            self.raw.incompatible_features |= Self::INCOMPAT_DIRTY;
        } else {
            self.raw.incompatible_features &= !Self::INCOMPAT_DIRTY;
        }
    }

    pub fn is_corrupt(&self) -> bool {
        self.raw.incompatible_features & Self::INCOMPAT_CORRUPT != 0
    }

    pub(crate) fn set_corrupt_flag(&mut self) {
        self.raw.incompatible_features |= Self::INCOMPAT_CORRUPT;
    }

    pub fn backing_filename(&self) -> Option<&String> {
        self.backing_filename.as_ref()
    }

    pub fn backing_format(&self) -> Option<&String> {
        for e in &self.extensions {
            if let Qcow2HeaderExtension::BackingFileFormat(fmt) = e {
                return Some(fmt);
            }
        }

        None
    }

    pub fn extensions(&self) -> &[Qcow2HeaderExtension] {
        &self.extensions
    }

    pub fn feature_name(&self, feat_type: Qcow2FeatureType, bit: u32) -> Option<&String> {
        for e in &self.extensions {
            if let Qcow2HeaderExtension::FeatureNameTable(names) = e {
                for (ftype, fbit, name) in names {
                    if *ftype == feat_type && u32::from(*fbit) == bit {
                        return Some(name);
                    }
                }
            }
        }

        None
    }
}

// L1 table entry:
//
// Bit  0 -  8:     Reserved (set to 0)
//
//      9 - 55:     Bits 9-55 of the offset into the image file at which the L2
//                  table starts. Must be aligned to a cluster boundary. If the
//                  offset is 0, the L2 table and all clusters described by this
//                  L2 table are unallocated.
//
//      56 - 62:    Reserved (set to 0)
//
//      63:         0 for an L2 table that is unused or requires COW, 1 if its
//                  refcount is exactly one. This information is only accurate
//                  in the active L1 table.
#[derive(Copy, Clone, Default, Debug)]
pub struct L1Entry(pub(crate) u64);

impl L1Entry {
    pub fn l2_offset(&self) -> u64 {
        self.0 & 0x00ff_ffff_ffff_fe00u64
    }

    pub fn is_copied(&self) -> bool {
        self.0 & (1u64 << 63) != 0
    }

    pub fn is_zero(&self) -> bool {
        self.l2_offset() == 0
    }

    pub fn reserved_bits(&self) -> u64 {
        self.0 & 0x7f00_0000_0000_01feu64
    }
}

impl TableEntry for L1Entry {
    fn try_from_plain(value: u64, info: &Qcow2Info) -> Qcow2Result<Self> {
        let entry = L1Entry(value);

        if entry.reserved_bits() != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid L1 entry 0x{:x}, reserved bits set (0x{:x})",
                value,
                entry.reserved_bits()
            )));
        }

        if info.in_cluster_offset(entry.l2_offset()) != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid L1 entry 0x{:x}, offset (0x{:x}) is not aligned to cluster size (0x{:x})",
                value,
                entry.l2_offset(),
                info.cluster_size()
            )));
        }

        Ok(entry)
    }

    #[inline(always)]
    fn into_plain(self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn get_value(&self) -> u64 {
        self.l2_offset()
    }
}

#[derive(Debug)]
pub struct L1Table {
    header_entries: u32,
    dirty_blocks: RefCell<VecDeque<u32>>,
    offset: Option<u64>,
    data: Vec<u8>,
}

impl L1Table {
    pub fn new(offset: Option<u64>, byte_size: usize, header_entries: u32) -> Self {
        let mut l1 = L1Table::new_empty(offset, byte_size);
        l1.header_entries = header_entries;
        l1
    }

    pub fn header_entries(&self) -> usize {
        self.header_entries as usize
    }

    pub fn update_header_entries(&mut self, entries: u32) {
        assert!((entries as usize) <= self.entries());
        self.header_entries = entries;
    }

    /// Create a clone that covers at least `at_least_index`, sized up
    /// to whole clusters.
    pub fn clone_and_grow(&self, at_least_index: usize, cluster_size: usize) -> Self {
        let new_byte_size = std::cmp::max((at_least_index + 1) * 8, self.data.len());
        let new_byte_size = new_byte_size.align_up(cluster_size).unwrap();
        let mut new_data = vec![0u8; new_byte_size];
        new_data[..self.data.len()].copy_from_slice(&self.data);

        Self {
            offset: None,
            data: new_data,
            header_entries: self.header_entries,
            dirty_blocks: RefCell::new(self.dirty_blocks.borrow().clone()),
        }
    }

    pub fn in_bounds(&self, index: usize) -> bool {
        index < self.header_entries as usize
    }

    /// Install a fresh L2 table pointer; the new table always has
    /// refcount 1, so COPIED is set.
    pub fn map_l2_offset(&mut self, index: usize, l2_offset: u64) {
        let l1entry = L1Entry((1 << 63) | l2_offset);
        debug_assert!(l1entry.reserved_bits() == 0);
        self.set(index, l1entry);
        self.set_dirty(index);
    }
}

impl_top_table_traits!(L1Table, L1Entry, data);

impl From<Vec<u8>> for L1Table {
    fn from(data: Vec<u8>) -> Self {
        Self {
            header_entries: 0,
            offset: None,
            data,
            dirty_blocks: RefCell::new(VecDeque::new()),
        }
    }
}

// L2 table entry:
//
// Bit  0 -  61:    Cluster descriptor
//
//      62:         0 for standard clusters
//                  1 for compressed clusters
//
//      63:         0 for clusters that are unused, compressed or require COW.
//                  1 for standard clusters whose refcount is exactly one.
//                  This information is only accurate in L2 tables
//                  that are reachable from the active L1 table.
//
// Standard Cluster Descriptor:
//
//     Bit       0:    If set to 1, the cluster reads as all zeros. Neither the
//                     host cluster nor the backing file is consulted.
//
//          1 -  8:    Reserved (set to 0)
//
//          9 - 55:    Bits 9-55 of host cluster offset. Must be aligned to a
//                     cluster boundary. If the offset is 0 and bit 63 is clear,
//                     the cluster is unallocated.
//
//         56 - 61:    Reserved (set to 0)
//
// Compressed Cluster Descriptor (x = 62 - (cluster_bits - 8)):
//
//     Bit  0 - x-1:   Host cluster offset
//          x - 61:    Number of additional 512-byte sectors used for the
//                     compressed data, beyond the sector containing the offset.
#[derive(Copy, Clone, Default, Debug)]
pub struct L2Entry(pub(crate) u64);

/// Mapping represents the mapping of a guest cluster to a source of
/// data.  `Mapping` and [`L2Entry`] convert to each other.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Where/how to get the mapped data from
    pub source: MappingSource,
    /// Offset in `source` from which to read the whole cluster data; for compressed clusters,
    /// this is generally not aligned to a cluster boundary
    pub cluster_offset: Option<u64>,
    /// For compressed data: upper limit on the number of bytes that comprise the compressed data
    pub compressed_length: Option<usize>,
    /// If true, `cluster_offset` may be written to in place; writing a
    /// cluster with COPIED clear requires a copy-on-write allocation
    /// first.
    pub copied: bool,
}

impl std::fmt::Display for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Source: {:?} offset 0x{:<x} compressed_len {} copied {}",
            self.source,
            self.cluster_offset.unwrap_or(u64::MAX),
            self.compressed_length.unwrap_or(usize::MIN),
            self.copied,
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MappingSource {
    /// Read the mapped data from the data file
    DataFile,
    /// Read the mapped data from the backing file
    Backing,
    /// This is zero data; use memset(0) instead of reading it
    Zero,
    /// Read compressed data from the data file
    Compressed,
    /// Unallocated
    Unallocated,
}

impl L2Entry {
    #[inline(always)]
    pub fn cluster_offset(&self) -> u64 {
        self.0 & 0x00ff_ffff_ffff_fe00u64
    }

    #[inline(always)]
    pub fn is_compressed(&self) -> bool {
        self.0 & (1u64 << 62) != 0
    }

    #[inline(always)]
    pub fn is_copied(&self) -> bool {
        self.0 & (1u64 << 63) != 0
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0 & (1u64 << 0) != 0
    }

    #[inline(always)]
    pub fn reserved_bits(&self) -> u64 {
        if self.is_compressed() {
            self.0 & 0x8000_0000_0000_0000u64
        } else {
            self.0 & 0x3f00_0000_0000_01feu64
        }
    }

    #[inline(always)]
    pub fn compressed_descriptor(&self) -> u64 {
        self.0 & 0x3fff_ffff_ffff_ffffu64
    }

    /// If this entry is compressed, return the start host offset and
    /// upper limit on the compressed number of bytes.
    #[inline(always)]
    pub fn compressed_range(&self, cluster_bits: u32) -> Option<(u64, usize)> {
        if self.is_compressed() {
            let desc = self.compressed_descriptor();
            let compressed_offset_bits = 62 - (cluster_bits - 8);
            let offset = desc & ((1 << compressed_offset_bits) - 1) & 0x00ff_ffff_ffff_ffffu64;
            let sectors = (desc >> compressed_offset_bits) as usize;
            // The first sector is not considered in `sectors`, so we add it and subtract the
            // number of bytes there that do not belong to this compressed cluster
            let length = (sectors + 1) * BLOCK_SIZE - (offset & 511) as usize;

            Some((offset, length))
        } else {
            None
        }
    }

    /// If this entry is allocated, return the host cluster offset and the number of clusters it
    /// references; otherwise return None.
    #[inline(always)]
    pub fn allocation(&self, cluster_bits: u32) -> Option<(u64, usize)> {
        if let Some((offset, length)) = self.compressed_range(cluster_bits) {
            // Compressed clusters can cross host cluster boundaries, and thus occupy two clusters
            let cluster_size = 1u64 << cluster_bits;
            let cluster_base = offset & !(cluster_size - 1);
            let clusters =
                ((offset + length as u64 + cluster_size - 1) - cluster_base) >> cluster_bits;
            Some((cluster_base, clusters as usize))
        } else {
            match self.cluster_offset() {
                0 => None,
                ofs => Some((ofs, 1)),
            }
        }
    }

    /// Convert to mapping; `guest_addr` is only used for the backing
    /// offset.
    #[inline]
    pub fn into_mapping(self, info: &Qcow2Info, guest_addr: &SplitGuestOffset) -> Mapping {
        let cluster_bits = info.cluster_bits() as u32;
        if let Some((offset, length)) = self.compressed_range(cluster_bits) {
            Mapping {
                source: MappingSource::Compressed,
                cluster_offset: Some(offset),
                compressed_length: Some(length),
                copied: false,
            }
        } else if self.is_zero() {
            let offset = match self.cluster_offset() {
                0 => None,
                ofs => Some(ofs),
            };

            Mapping {
                source: MappingSource::Zero,
                cluster_offset: offset,
                compressed_length: None,
                copied: offset.is_some() && self.is_copied(),
            }
        } else {
            match self.cluster_offset() {
                0 => {
                    if info.has_back_file() {
                        Mapping {
                            source: MappingSource::Backing,
                            cluster_offset: Some(guest_addr.cluster_start(info)),
                            compressed_length: None,
                            copied: false,
                        }
                    } else {
                        Mapping {
                            source: MappingSource::Unallocated,
                            cluster_offset: None,
                            compressed_length: None,
                            copied: false,
                        }
                    }
                }
                ofs => Mapping {
                    source: MappingSource::DataFile,
                    cluster_offset: Some(ofs),
                    compressed_length: None,
                    copied: self.is_copied(),
                },
            }
        }
    }

    /// Convert mapping into an L2 entry.
    #[inline]
    pub fn from_mapping(value: Mapping, cluster_bits: u32) -> Self {
        debug_assert!(value.cluster_offset.unwrap_or(0) <= 0x00ff_ffff_ffff_ffffu64);

        let num_val: u64 = match value.source {
            MappingSource::DataFile => {
                debug_assert!(value.compressed_length.is_none());
                if value.copied {
                    (1 << 63) | value.cluster_offset.unwrap()
                } else {
                    value.cluster_offset.unwrap()
                }
            }

            MappingSource::Backing => {
                debug_assert!(value.compressed_length.is_none() && !value.copied);
                0
            }

            MappingSource::Zero => {
                debug_assert!(value.compressed_length.is_none());
                if value.copied {
                    (1 << 63) | value.cluster_offset.unwrap() | 0x1
                } else {
                    value.cluster_offset.unwrap_or(0) | 0x1
                }
            }

            MappingSource::Compressed => {
                debug_assert!(!value.copied);
                let compressed_offset_bits = 62 - (cluster_bits - 8);
                let offset = value.cluster_offset.unwrap();
                let length = value.compressed_length.unwrap();
                assert!(length < 1 << cluster_bits);

                // The first sector is not considered, so we subtract the number of bytes in it
                // that belong to this compressed cluster from `length`:
                // ceil((length - (512 - (offset & 511))) / 512)
                // = (length + 511 - 512 + (offset & 511)) / 512
                let sectors = (length - 1 + (offset & 511) as usize) / BLOCK_SIZE;

                (1 << 62) | ((sectors as u64) << compressed_offset_bits) | offset
            }
            MappingSource::Unallocated => 0,
        };

        let entry = L2Entry(num_val);
        debug_assert!(entry.reserved_bits() == 0);
        entry
    }
}

impl Mapping {
    #[inline]
    pub fn plain_offset(&self, in_cluster_offset: usize) -> Option<u64> {
        (self.source == MappingSource::DataFile && self.copied)
            .then(|| self.cluster_offset.unwrap() + in_cluster_offset as u64)
    }

    #[inline]
    pub fn allocated(&self) -> bool {
        self.source != MappingSource::Unallocated
    }
}

impl TableEntry for L2Entry {
    fn try_from_plain(value: u64, info: &Qcow2Info) -> Qcow2Result<Self> {
        let entry = L2Entry(value);

        if entry.reserved_bits() != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid L2 entry 0x{:x}, reserved bits set (0x{:x})",
                value,
                entry.reserved_bits()
            )));
        }

        if !entry.is_compressed() && info.in_cluster_offset(entry.cluster_offset()) != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid L2 entry 0x{:x}, offset (0x{:x}) is not aligned to cluster size (0x{:x})",
                value,
                entry.cluster_offset(),
                info.cluster_size()
            )));
        }

        Ok(entry)
    }

    fn into_plain(self) -> u64 {
        self.0
    }
}

// Given an offset into the virtual disk, the offset into the image file can be
// obtained as follows:
//
// l2_entries = (cluster_size / sizeof(uint64_t))
//
// l2_index = (offset / cluster_size) % l2_entries
// l1_index = (offset / cluster_size) / l2_entries
//
// l2_table = load_cluster(l1_table[l1_index]);
// cluster_offset = l2_table[l2_index];
//
// return cluster_offset + (offset % cluster_size)
#[derive(Debug)]
pub struct L2Table {
    offset: Option<u64>,
    cluster_bits: u32,
    data: Vec<u8>,
}

impl L2Table {
    pub fn new(offset: Option<u64>, byte_size: usize, cluster_bits: usize) -> L2Table {
        let mut t = L2Table::new_empty(offset, byte_size);
        t.cluster_bits = cluster_bits as u32;
        t
    }

    #[inline]
    pub fn get_entry(&self, info: &Qcow2Info, lookup_addr: &SplitGuestOffset) -> L2Entry {
        self.get(lookup_addr.l2_index(info))
    }

    #[inline]
    pub fn get_mapping(&self, info: &Qcow2Info, lookup_addr: &SplitGuestOffset) -> Mapping {
        self.get_entry(info, lookup_addr).into_mapping(info, lookup_addr)
    }

    /// Map `index` to a freshly allocated `host_cluster` (COPIED set).
    ///
    /// If the previous entry pointed to an allocated cluster, return
    /// the old allocation so its refcount can be decreased (offset of
    /// the first cluster and number of clusters; compressed clusters
    /// can span across host cluster boundaries).
    #[must_use]
    pub fn map_cluster(&mut self, index: usize, host_cluster: u64) -> Option<(u64, usize)> {
        let allocation = self.get(index).allocation(self.cluster_bits);

        self.set(
            index,
            L2Entry::from_mapping(
                Mapping {
                    source: MappingSource::DataFile,
                    cluster_offset: Some(host_cluster),
                    compressed_length: None,
                    copied: true,
                },
                self.cluster_bits,
            ),
        );

        match allocation {
            Some((a_offset, a_count)) if a_offset == host_cluster && a_count == 1 => None,
            other => other,
        }
    }
}

impl From<Vec<u8>> for L2Table {
    fn from(data: Vec<u8>) -> Self {
        Self {
            offset: None,
            cluster_bits: 0,
            data,
        }
    }
}

impl_table_traits!(L2Table, L2Entry, data);

#[derive(Copy, Clone, Default, Debug)]
pub struct RefTableEntry(pub u64);

impl RefTableEntry {
    pub fn refblock_offset(&self) -> u64 {
        self.0 & 0xffff_ffff_ffff_fe00u64
    }

    pub fn is_zero(&self) -> bool {
        self.refblock_offset() == 0
    }

    pub fn reserved_bits(&self) -> u64 {
        self.0 & 0x0000_0000_0000_01ffu64
    }
}

impl TableEntry for RefTableEntry {
    fn try_from_plain(value: u64, info: &Qcow2Info) -> Qcow2Result<Self> {
        let entry = RefTableEntry(value);

        if entry.reserved_bits() != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid reftable entry 0x{:x}, reserved bits set (0x{:x})",
                value,
                entry.reserved_bits()
            )));
        }

        if info.in_cluster_offset(entry.refblock_offset()) != 0 {
            return Err(Qcow2Error::corrupt(format!(
                "Invalid reftable entry 0x{:x}, offset (0x{:x}) is not aligned to cluster size (0x{:x})",
                value,
                entry.refblock_offset(),
                info.cluster_size()
            )));
        }

        Ok(entry)
    }

    #[inline(always)]
    fn into_plain(self) -> u64 {
        self.0
    }

    #[inline(always)]
    fn get_value(&self) -> u64 {
        self.refblock_offset()
    }
}

#[derive(Debug)]
pub struct RefTable {
    dirty_blocks: RefCell<VecDeque<u32>>,
    offset: Option<u64>,
    data: Vec<u8>,
}

impl RefTable {
    pub fn new(offset: Option<u64>, byte_size: usize) -> Self {
        RefTable::new_empty(offset, byte_size)
    }

    /// Create a clone that covers at least `at_least_index`, sized up
    /// to whole clusters.  The clone has no offset; growth allocates
    /// new clusters for it.
    pub fn clone_and_grow(&self, at_least_index: usize, cluster_size: usize) -> Self {
        let new_byte_size = std::cmp::max((at_least_index + 1) * 8, self.data.len());
        let new_byte_size = new_byte_size.align_up(cluster_size).unwrap();
        let mut new_data = vec![0u8; new_byte_size];
        new_data[..self.data.len()].copy_from_slice(&self.data);

        Self {
            offset: None,
            data: new_data,
            dirty_blocks: RefCell::new(self.dirty_blocks.borrow().clone()),
        }
    }

    pub fn in_bounds(&self, index: usize) -> bool {
        index < self.entries()
    }

    pub fn set_refblock_offset(&mut self, index: usize, rb_offset: u64) {
        let rt_entry = RefTableEntry(rb_offset);
        debug_assert!(rt_entry.reserved_bits() == 0);

        self.set(index, rt_entry);
        self.set_dirty(index);
    }
}

impl From<Vec<u8>> for RefTable {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            dirty_blocks: RefCell::new(VecDeque::new()),
            offset: None,
        }
    }
}

impl_top_table_traits!(RefTable, RefTableEntry, data);

/// One cluster of refcounts; entry width is `1 << refcount_order`
/// bits.
#[derive(Debug)]
pub struct RefBlock {
    offset: Option<u64>,
    refcount_order: u8,
    data: Vec<u8>,
}

impl RefBlock {
    pub fn new(refcount_order: u8, byte_size: usize, offset: Option<u64>) -> Self {
        debug_assert!(refcount_order <= 6);
        let mut rb = RefBlock {
            offset,
            refcount_order,
            data: vec![0u8; byte_size],
        };
        rb.set_offset(offset);
        rb
    }

    pub fn entries(&self) -> usize {
        self.data.len() * 8 / (1usize << self.refcount_order)
    }

    pub fn get_offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn set_offset(&mut self, offset: Option<u64>) {
        self.offset = offset;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_update(&self) -> bool {
        self.offset.is_some()
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> u64 {
        let raw_data = &self.data;
        match self.refcount_order {
            // refcount_bits == 1
            0 => ((raw_data[index / 8] >> (index % 8)) & 0b0000_0001) as u64,

            // refcount_bits == 2
            1 => ((raw_data[index / 4] >> (2 * (index % 4))) & 0b0000_0011) as u64,

            // refcount_bits == 4
            2 => ((raw_data[index / 2] >> (4 * (index % 2))) & 0b0000_1111) as u64,

            // refcount_bits == 8
            3 => raw_data[index] as u64,

            // refcount_bits == 16
            4 => codec::read_u16(raw_data, index * 2) as u64,

            // refcount_bits == 32
            5 => codec::read_u32(raw_data, index * 4) as u64,

            // refcount_bits == 64
            6 => codec::read_u64(raw_data, index * 8),

            _ => unreachable!(),
        }
    }

    pub fn set(&mut self, index: usize, value: u64) -> Qcow2Result<()> {
        let order = self.refcount_order;
        let overflow = |width: u32| {
            Qcow2Error::refcount_overflow(format!(
                "Cannot increase refcount beyond {} with refcount_bits={}",
                ((1u128 << width) - 1),
                width
            ))
        };

        let raw_data = &mut self.data;
        match order {
            // refcount_bits == 1
            0 => {
                if value > 0b0000_0001 {
                    return Err(overflow(1));
                }
                raw_data[index / 8] = (raw_data[index / 8] & !(0b0000_0001 << (index % 8)))
                    | ((value as u8) << (index % 8));
            }

            // refcount_bits == 2
            1 => {
                if value > 0b0000_0011 {
                    return Err(overflow(2));
                }
                raw_data[index / 4] = (raw_data[index / 4] & !(0b0000_0011 << (2 * (index % 4))))
                    | ((value as u8) << (2 * (index % 4)));
            }

            // refcount_bits == 4
            2 => {
                if value > 0b0000_1111 {
                    return Err(overflow(4));
                }
                raw_data[index / 2] = (raw_data[index / 2] & !(0b0000_1111 << (4 * (index % 2))))
                    | ((value as u8) << (4 * (index % 2)));
            }

            // refcount_bits == 8
            3 => {
                if value > u8::MAX as u64 {
                    return Err(overflow(8));
                }
                raw_data[index] = value as u8;
            }

            // refcount_bits == 16
            4 => {
                if value > u16::MAX as u64 {
                    return Err(overflow(16));
                }
                codec::write_u16(raw_data, index * 2, value as u16);
            }

            // refcount_bits == 32
            5 => {
                if value > u32::MAX as u64 {
                    return Err(overflow(32));
                }
                codec::write_u32(raw_data, index * 4, value as u32);
            }

            // refcount_bits == 64
            6 => codec::write_u64(raw_data, index * 8, value),

            _ => unreachable!(),
        }

        Ok(())
    }

    pub fn increment(&mut self, index: usize) -> Qcow2Result<()> {
        let val = self
            .get(index)
            .checked_add(1)
            .ok_or_else(|| {
                Qcow2Error::refcount_overflow(format!(
                    "Cannot increase refcount beyond {}",
                    u64::MAX
                ))
            })?;
        self.set(index, val)
    }

    pub fn decrement(&mut self, index: usize) -> Qcow2Result<()> {
        let val = self
            .get(index)
            .checked_sub(1)
            .ok_or_else(|| Qcow2Error::refcount_underflow("Cannot decrease refcount below 0"))?;
        self.set(index, val)
    }

    #[inline(always)]
    pub fn is_free(&self, index: usize) -> bool {
        self.get(index) == 0
    }
}

pub trait TableEntry
where
    Self: Copy + Sized + std::fmt::Debug,
{
    fn try_from_plain(value: u64, info: &Qcow2Info) -> Qcow2Result<Self>;
    fn into_plain(self) -> u64;

    /// Only for top-table entries to return the stored offset.
    #[inline(always)]
    fn get_value(&self) -> u64 {
        unimplemented!();
    }
}

pub trait Table: From<Vec<u8>> {
    type Entry: TableEntry;

    fn entries(&self) -> usize;
    fn get(&self, index: usize) -> Self::Entry;
    fn set(&mut self, index: usize, value: Self::Entry);
    fn get_offset(&self) -> Option<u64>;
    fn set_offset(&mut self, offset: Option<u64>);

    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];

    fn byte_size(&self) -> usize {
        self.as_bytes().len()
    }

    fn cluster_count(&self, info: &Qcow2Info) -> usize {
        (self.byte_size() + info.cluster_size() - 1) / info.cluster_size()
    }

    /// A table with an offset is backed by (loaded from / assigned to)
    /// the image file.
    fn is_update(&self) -> bool {
        self.get_offset().is_some()
    }

    fn new_empty(offset: Option<u64>, byte_size: usize) -> Self {
        let mut table: Self = vec![0u8; byte_size].into();
        table.set_offset(offset);
        table
    }

    #[inline(always)]
    fn set_dirty(&self, _idx: usize) {}

    #[inline(always)]
    fn pop_dirty_blk_idx(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::Qcow2Info;

    fn simple_info(cluster_bits: usize, refcount_order: u8) -> Qcow2Info {
        Qcow2Info::for_test(cluster_bits, refcount_order)
    }

    fn v3_header_raw(size: u64, cluster_bits: u32) -> Qcow2RawHeader {
        Qcow2RawHeader {
            magic: Qcow2Header::QCOW2_MAGIC,
            version: 3,
            cluster_bits,
            size,
            l1_size: {
                let cluster_size = 1u64 << cluster_bits;
                div_round_up(size, cluster_size * (cluster_size / 8)) as u32
            },
            l1_table_offset: 3u64 << cluster_bits,
            refcount_table_offset: 1u64 << cluster_bits,
            refcount_table_clusters: 1,
            refcount_order: 4,
            header_length: Qcow2Header::V3_HEADER_SIZE as u32,
            ..Default::default()
        }
    }

    #[test]
    fn test_l1_table() {
        let cluster_size = 1u64 << 16;
        let size = 4096;

        let mut l1 = L1Table::new_empty(Some(cluster_size), size);
        assert_eq!(l1.entries(), size / std::mem::size_of::<u64>());

        let entry = l1.get(0);
        assert!(entry.is_zero());

        let l2_offset = cluster_size * 3;
        l1.set(0, L1Entry(l2_offset));
        let entry = l1.get(0);
        assert_eq!(entry.l2_offset(), l2_offset);

        // stored big-endian
        assert_eq!(codec::read_u64(l1.as_bytes(), 0), l2_offset);
    }

    #[test]
    fn test_refcount_table() {
        let cluster_size = 1u64 << 16;
        let size = 4096;

        let mut rc = RefTable::new_empty(Some(cluster_size), size);
        assert_eq!(rc.entries(), size / std::mem::size_of::<u64>());

        let entry = rc.get(0);
        assert!(entry.is_zero());

        let rcb_offset = cluster_size * 3;
        rc.set(0, RefTableEntry(rcb_offset));
        let entry = rc.get(0);
        assert_eq!(entry.refblock_offset(), rcb_offset);

        assert_eq!(codec::read_u64(rc.as_bytes(), 0), rcb_offset);
    }

    #[test]
    fn test_refcount_block() {
        let size = 4096;
        let refcount_order = 4;
        let entries = size * 8 / (1 << refcount_order);

        let mut rc_b = RefBlock::new(refcount_order as u8, size, Some(2 << 16));
        assert_eq!(rc_b.entries(), entries);

        for i in 0..entries {
            assert_eq!(rc_b.get(i), 0);
            rc_b.increment(i).unwrap();
            assert_eq!(rc_b.get(i), 1);
        }
    }

    #[test]
    fn test_refcount_block_widths() {
        let mut refblock = RefBlock::new(3, 4096, Some(0));
        assert_eq!(refblock.entries(), 4096);
        assert_eq!(refblock.get_offset(), Some(0));

        assert!(refblock.is_free(0));

        refblock.increment(0).unwrap();
        assert_eq!(refblock.get(0), 1);

        refblock.decrement(0).unwrap();
        assert_eq!(refblock.get(0), 0);

        let err = refblock.decrement(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::Qcow2ErrorKind::RefcountUnderflow);

        assert!(refblock.set(0, 255).is_ok());
        let err = refblock.set(0, 256).unwrap_err();
        assert_eq!(err.kind(), crate::error::Qcow2ErrorKind::RefcountOverflow);

        // sub-byte widths
        for order in 0..3u8 {
            let mut rb = RefBlock::new(order, 512, None);
            let max = (1u64 << (1 << order)) - 1;
            rb.set(3, max).unwrap();
            assert_eq!(rb.get(3), max);
            assert_eq!(rb.get(2), 0);
            assert_eq!(rb.get(4), 0);
            assert!(rb.set(3, max + 1).is_err());
        }
    }

    #[test]
    fn test_l2_entry_flags() {
        let info = simple_info(16, 4);

        let e = L2Entry((1 << 63) | 0x50000);
        assert!(e.is_copied());
        assert!(!e.is_compressed());
        assert!(!e.is_zero());
        assert_eq!(e.cluster_offset(), 0x50000);
        assert_eq!(e.reserved_bits(), 0);

        let m = e.into_mapping(&info, &SplitGuestOffset(0));
        assert_eq!(m.source, MappingSource::DataFile);
        assert_eq!(m.cluster_offset, Some(0x50000));
        assert!(m.copied);
        assert_eq!(m.plain_offset(0x123), Some(0x50123));

        let zero = L2Entry(1);
        let m = zero.into_mapping(&info, &SplitGuestOffset(0));
        assert_eq!(m.source, MappingSource::Zero);
        assert_eq!(m.cluster_offset, None);

        let unalloc = L2Entry(0);
        let m = unalloc.into_mapping(&info, &SplitGuestOffset(0));
        assert_eq!(m.source, MappingSource::Unallocated);

        let round_trip = L2Entry::from_mapping(
            e.into_mapping(&info, &SplitGuestOffset(0)),
            info.cluster_bits() as u32,
        );
        assert_eq!(round_trip.into_plain(), e.into_plain());
    }

    #[test]
    fn test_l2_entry_compressed_range() {
        let cluster_bits = 16u32;
        // offset 0x12345, 3 additional sectors
        let compressed_offset_bits = 62 - (cluster_bits - 8);
        let raw = (1u64 << 62) | (3u64 << compressed_offset_bits) | 0x12345;
        let e = L2Entry(raw);

        assert!(e.is_compressed());
        let (offset, length) = e.compressed_range(cluster_bits).unwrap();
        assert_eq!(offset, 0x12345);
        assert_eq!(length, 4 * 512 - (0x12345 & 511));

        let (base, clusters) = e.allocation(cluster_bits).unwrap();
        assert_eq!(base, 0x10000);
        assert_eq!(clusters, 1);
    }

    #[test]
    fn test_map_cluster_returns_displaced_allocation() {
        let info = simple_info(16, 4);
        let mut l2 = L2Table::new(Some(0x10000), 4096, info.cluster_bits());

        // mapping an empty slot displaces nothing
        assert!(l2.map_cluster(4, 0x70000).is_none());
        assert!(l2.get(4).is_copied());
        assert_eq!(l2.get(4).cluster_offset(), 0x70000);

        // remapping to a new cluster returns the old allocation
        let displaced = l2.map_cluster(4, 0x90000);
        assert_eq!(displaced, Some((0x70000, 1)));

        // remapping to the same cluster is not a displacement
        assert!(l2.map_cluster(4, 0x90000).is_none());
    }

    #[test]
    fn test_translation_identity() {
        for cluster_bits in [9usize, 12, 16, 21] {
            let info = simple_info(cluster_bits, 4);
            let c = 1u64 << cluster_bits;
            let l2_entries = c / 8;

            for guest in [
                0u64,
                1,
                c - 1,
                c,
                c * l2_entries - 1,
                c * l2_entries,
                c * l2_entries * 7 + c * 3 + 17,
            ] {
                let split = SplitGuestOffset(guest);
                let l1 = split.l1_index(&info) as u64;
                let l2 = split.l2_index(&info) as u64;
                let off = split.in_cluster_offset(&info) as u64;
                assert_eq!(l1 * (c * l2_entries) + l2 * c + off, guest);
            }
        }
    }

    #[test]
    fn test_header_round_trip_with_extensions() {
        let raw = v3_header_raw(64 << 30, 16);
        let extensions = vec![
            Qcow2HeaderExtension::FeatureNameTable(vec![
                (Qcow2FeatureType::Incompatible, 0, "dirty bit".to_string()),
                (Qcow2FeatureType::Incompatible, 1, "corrupt bit".to_string()),
                (Qcow2FeatureType::Compatible, 0, "lazy refcounts".to_string()),
            ]),
            Qcow2HeaderExtension::Unknown {
                extension_type: 0x12345678,
                data: vec![1, 2, 3, 4, 5],
            },
            Qcow2HeaderExtension::Bitmaps(vec![0; 24]),
        ];
        let mut header =
            Qcow2Header::from_parts(raw, Some("base.qcow2".to_string()), extensions.clone());

        let buf = header.serialize_to_buf().unwrap();
        let mut padded = buf.clone();
        padded.resize(4096, 0);

        let decoded = Qcow2Header::from_buf(&padded).unwrap();
        assert_eq!(decoded.version(), 3);
        assert_eq!(decoded.size(), 64 << 30);
        assert_eq!(decoded.cluster_bits(), 16);
        assert_eq!(decoded.backing_filename(), Some(&"base.qcow2".to_string()));
        assert_eq!(decoded.extensions(), &extensions[..]);
        assert_eq!(
            decoded.feature_name(Qcow2FeatureType::Compatible, 0),
            Some(&"lazy refcounts".to_string())
        );

        // encode again, byte-identical
        let mut decoded = decoded;
        assert_eq!(decoded.serialize_to_buf().unwrap(), buf);
    }

    #[test]
    fn test_header_v2_synthesis() {
        let mut raw = v3_header_raw(1 << 20, 16);
        raw.version = 2;
        let mut header = Qcow2Header::from_parts(raw, None, Vec::new());

        let buf = header.serialize_to_buf().unwrap();
        // v2 fixed header is 72 bytes, then the End extension
        assert_eq!(codec::read_u32(&buf, 4), 2);

        let mut padded = buf;
        padded.resize(4096, 0);
        let decoded = Qcow2Header::from_buf(&padded).unwrap();
        assert_eq!(decoded.version(), 2);
        assert_eq!(decoded.refcount_order(), 4);
        assert_eq!(decoded.header_length(), 72);
        assert_eq!(decoded.incompatible_features(), 0);
        assert_eq!(decoded.compatible_features(), 0);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_version() {
        let mut raw = v3_header_raw(1 << 20, 16);
        raw.magic = 0x514649fc;
        let mut h = Qcow2Header::from_parts(raw, None, Vec::new());
        let mut buf = h.serialize_to_buf().unwrap();
        buf.resize(4096, 0);
        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::Qcow2ErrorKind::Unsupported);
        assert_eq!(err.to_string(), "Image is not in qcow2 format");

        let mut raw = v3_header_raw(1 << 20, 16);
        raw.version = 4;
        let mut h = Qcow2Header::from_parts(raw, None, Vec::new());
        let mut buf = h.serialize_to_buf().unwrap();
        buf.resize(4096, 0);
        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported qcow2 version");
    }

    #[test]
    fn test_header_rejects_unknown_incompatible_feature() {
        let mut raw = v3_header_raw(1 << 20, 16);
        raw.incompatible_features = 1 << 5;
        let mut h = Qcow2Header::from_parts(raw, None, Vec::new());
        let mut buf = h.serialize_to_buf().unwrap();
        buf.resize(4096, 0);

        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::Qcow2ErrorKind::IncompatibleFeature);
        assert!(err.to_string().contains("5"));
    }

    #[test]
    fn test_header_too_short_and_too_long() {
        let err = Qcow2Header::from_buf(&[0u8; 32]).unwrap_err();
        assert_eq!(err.to_string(), "qcow2 header too short");

        let mut raw = v3_header_raw(1 << 20, 9);
        raw.header_length = 1024; // larger than the 512-byte cluster
        raw.l1_table_offset = 3 << 9;
        raw.refcount_table_offset = 1 << 9;
        let bincode = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_big_endian();
        let mut buf = bincode.serialize(&raw).unwrap();
        buf.resize(4096, 0);
        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert_eq!(err.to_string(), "qcow2 header exceeds cluster size");
    }

    /// The 104-byte prefix of a well-known Docker.qcow2 image (64 GiB
    /// virtual size, 64 KiB clusters).
    #[test]
    fn test_docker_fingerprint() {
        let raw = Qcow2RawHeader {
            magic: Qcow2Header::QCOW2_MAGIC,
            version: 3,
            cluster_bits: 16,
            size: 68719476736,
            l1_size: 128,
            l1_table_offset: 131072,
            refcount_table_offset: 65536,
            refcount_table_clusters: 1,
            refcount_order: 4,
            header_length: 104,
            ..Default::default()
        };
        let mut h = Qcow2Header::from_parts(raw, None, Vec::new());
        let mut buf = h.serialize_to_buf().unwrap();

        assert_eq!(&buf[0..4], &[81, 70, 73, 251]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 3]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 16]);
        assert_eq!(&buf[24..32], &[0, 0, 0, 16, 0, 0, 0, 0]);
        assert_eq!(&buf[36..40], &[0, 0, 0, 128]);
        assert_eq!(&buf[40..48], &[0, 0, 0, 0, 0, 2, 0, 0]);
        assert_eq!(&buf[48..56], &[0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(&buf[56..60], &[0, 0, 0, 1]);
        assert_eq!(&buf[96..100], &[0, 0, 0, 4]);
        assert_eq!(&buf[100..104], &[0, 0, 0, 104]);

        buf.resize(4096, 0);
        let decoded = Qcow2Header::from_buf(&buf).unwrap();
        assert_eq!(decoded.size(), 68719476736);
        assert_eq!(decoded.cluster_bits(), 16);
        assert_eq!(decoded.l1_table_entries(), 128);
        assert_eq!(decoded.l1_table_offset(), 131072);
        assert_eq!(decoded.reftable_offset(), 65536);
        assert_eq!(decoded.reftable_clusters(), 1);
        assert_eq!(decoded.incompatible_features(), 0);
        assert_eq!(decoded.compatible_features(), 0);
        assert_eq!(decoded.refcount_order(), 4);
    }
}
