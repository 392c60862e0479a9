use crate::cache::Qcow2Cache;
use crate::dev::Qcow2Info;
use crate::error::{Qcow2Error, Qcow2Result};
use crate::file::Qcow2ImageFile;
use crate::helpers::{div_round_up, IntAlignment};
use crate::meta::{
    L1Entry, L1Table, L2Table, Mapping, MappingSource, Qcow2Header, SplitGuestOffset, Table,
    TableEntry, BLOCK_SIZE,
};
use crate::ops::Qcow2IoOps;
use crate::refcount::RefcountEngine;
use std::cell::RefCell;
use std::rc::Rc;

/// Translates guest offsets to host offsets through the two-level
/// L1/L2 map, allocates backing clusters on write and grows the L1
/// table on resize.
pub struct ClusterMap<T> {
    file: Rc<Qcow2ImageFile<T>>,
    header: Rc<RefCell<Qcow2Header>>,
    info: Rc<Qcow2Info>,

    l1table: L1Table,
    l2cache: Qcow2Cache<L2Table>,
}

impl<T: Qcow2IoOps> ClusterMap<T> {
    pub(crate) fn new(
        file: Rc<Qcow2ImageFile<T>>,
        header: Rc<RefCell<Qcow2Header>>,
        info: Rc<Qcow2Info>,
    ) -> Self {
        let (l1_entries, l1_bytes) = {
            let h = header.borrow();
            let bytes = std::cmp::max(h.l1_table_entries() * 8, 8)
                .align_up(info.cluster_size())
                .unwrap();
            (h.l1_table_entries() as u32, bytes)
        };
        let l2_cache_cnt = info.l2_cache_cnt;

        ClusterMap {
            file,
            header,
            info,
            l1table: L1Table::new(None, l1_bytes, l1_entries),
            l2cache: Qcow2Cache::new(l2_cache_cnt),
        }
    }

    /// The L1 table is loaded on first use, not at open.
    fn ensure_l1_loaded(&mut self) -> Qcow2Result<()> {
        if self.l1table.is_update() {
            return Ok(());
        }

        let offset = self.header.borrow().l1_table_offset();
        self.l1table.set_offset(Some(offset));
        self.file
            .read_exact(offset, self.l1table.as_bytes_mut())
            .map_err(|e| e.prepend("load L1 table"))?;

        log::debug!(
            "loaded L1 table: offset {:x} header entries {}",
            offset,
            self.l1table.header_entries()
        );
        Ok(())
    }

    fn get_l1_entry(&mut self, split: &SplitGuestOffset) -> Qcow2Result<L1Entry> {
        self.ensure_l1_loaded()?;

        let l1_index = split.l1_index(&self.info);
        if !self.l1table.in_bounds(l1_index) {
            return Err(Qcow2Error::corrupt(format!(
                "guest offset 0x{:x} beyond the active L1 table",
                split.guest_addr()
            )));
        }

        L1Entry::try_from_plain(self.l1table.get(l1_index).into_plain(), &self.info)
    }

    fn insert_l2(&mut self, l1_index: usize, l2: L2Table) -> Qcow2Result<()> {
        if let Some((victim_key, victim)) = self.l2cache.put(l1_index, l2) {
            let offset = victim
                .get_offset()
                .ok_or_else(|| Qcow2Error::corrupt("dirty L2 table without backing offset"))?;
            log::debug!("write back evicted L2 table {} at {:x}", victim_key, offset);
            self.file.write_all(offset, victim.as_bytes())?;
        }
        Ok(())
    }

    /// Bring the L2 table named by a non-empty L1 entry into the cache.
    fn ensure_l2_cached(&mut self, l1_index: usize, l1_e: &L1Entry) -> Qcow2Result<()> {
        if self.l2cache.contains_key(l1_index) {
            return Ok(());
        }

        let offset = l1_e.l2_offset();
        let mut l2 = L2Table::new(
            Some(offset),
            self.info.cluster_size(),
            self.info.cluster_bits(),
        );
        self.file
            .read_exact(offset, l2.as_bytes_mut())
            .map_err(|e| e.prepend("load L2 table"))?;

        self.insert_l2(l1_index, l2)
    }

    /// Translate a guest offset.  Reports how the containing cluster
    /// maps: unallocated, zero, compressed or plain data (and whether
    /// it is COPIED, i.e. exclusively owned).
    pub fn lookup(&mut self, guest_offset: u64) -> Qcow2Result<Mapping> {
        let split = SplitGuestOffset(guest_offset);
        let info = Rc::clone(&self.info);

        let l1_e = self.get_l1_entry(&split)?;
        if l1_e.is_zero() {
            let mapping = if info.has_back_file() {
                Mapping {
                    source: MappingSource::Backing,
                    cluster_offset: Some(split.cluster_start(&info)),
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
            };
            return Ok(mapping);
        }

        let l1_index = split.l1_index(&info);
        self.ensure_l2_cached(l1_index, &l1_e)?;

        let raw = self
            .l2cache
            .get(l1_index)
            .unwrap()
            .get_entry(&info, &split)
            .into_plain();
        let entry = crate::meta::L2Entry::try_from_plain(raw, &info)
            .map_err(|e| e.prepend("L2 lookup"))?;

        Ok(entry.into_mapping(&info, &split))
    }

    /// Write the dirty sectors of the L1 table.
    fn flush_l1(&mut self) -> Qcow2Result<()> {
        if let Some(l1_offset) = self.l1table.get_offset() {
            while let Some(blk) = self.l1table.pop_dirty_blk_idx() {
                let start = blk as usize * BLOCK_SIZE;
                let end = std::cmp::min(start + BLOCK_SIZE, self.l1table.byte_size());
                self.file.write_all(
                    l1_offset + start as u64,
                    &self.l1table.as_bytes()[start..end],
                )?;
            }
        }
        Ok(())
    }

    /// Write one cached L2 table back in place.
    fn flush_l2(&mut self, l1_index: usize) -> Qcow2Result<()> {
        if let Some(l2) = self.l2cache.peek(l1_index) {
            let offset = l2
                .get_offset()
                .ok_or_else(|| Qcow2Error::corrupt("dirty L2 table without backing offset"))?;
            self.file.write_all(offset, l2.as_bytes())?;
        }
        self.l2cache.set_dirty(l1_index, false);
        Ok(())
    }

    /// Write out all dirty L2 tables, then the dirty L1 sectors.
    pub fn flush(&mut self) -> Qcow2Result<()> {
        for key in self.l2cache.dirty_keys() {
            self.flush_l2(key)?;
        }
        self.flush_l1()
    }

    /// Fill up the L1 entry for `split`, allocating and materializing
    /// a fresh L2 table when the entry is still empty.
    fn ensure_l2_offset(
        &mut self,
        refcounts: &mut RefcountEngine<T>,
        split: &SplitGuestOffset,
    ) -> Qcow2Result<L1Entry> {
        let l1_e = self.get_l1_entry(split)?;
        if !l1_e.is_zero() {
            return Ok(l1_e);
        }

        let info = Rc::clone(&self.info);
        let l1_index = split.l1_index(&info);

        // refcount for the new table is on disk before the L1 points
        // at it; a failure in between leaks one cluster, it never
        // dangles
        let l2_offset = refcounts.alloc_clusters(info.cluster_size() as u64)?;

        let l2 = L2Table::new(Some(l2_offset), info.cluster_size(), info.cluster_bits());
        self.file.write_all(l2_offset, l2.as_bytes())?;
        self.insert_l2(l1_index, l2)?;

        log::debug!(
            "new L2 table for l1 index {} at {:x}",
            l1_index,
            l2_offset
        );

        self.l1table.map_l2_offset(l1_index, l2_offset);
        self.flush_l1()?;

        Ok(self.l1table.get(l1_index))
    }

    /// Allocate backing for the cluster containing `guest_offset` and
    /// return its host offset.
    ///
    /// A cluster that is already allocated with COPIED set is returned
    /// as is.  Otherwise a fresh cluster is allocated; with
    /// `copy_on_write` the current contents of a shared data cluster
    /// are carried over, without it the new cluster reads as zeroes.
    /// The old referent (shared cluster or zero-cluster preallocation)
    /// loses one reference after the new pointer is on disk.
    pub fn allocate(
        &mut self,
        refcounts: &mut RefcountEngine<T>,
        guest_offset: u64,
        copy_on_write: bool,
    ) -> Qcow2Result<u64> {
        let info = Rc::clone(&self.info);
        let split = SplitGuestOffset(guest_offset);

        let l1_e = self.ensure_l2_offset(refcounts, &split)?;
        let l1_index = split.l1_index(&info);
        self.ensure_l2_cached(l1_index, &l1_e)?;

        let entry = {
            let l2 = self.l2cache.get(l1_index).unwrap();
            let raw = l2.get_entry(&info, &split).into_plain();
            crate::meta::L2Entry::try_from_plain(raw, &info)?
        };
        let mapping = entry.into_mapping(&info, &split);

        match mapping.source {
            MappingSource::DataFile if mapping.copied => {
                return Ok(mapping.cluster_offset.unwrap());
            }
            MappingSource::Compressed => {
                return Err(Qcow2Error::unsupported(
                    "rewriting compressed clusters is not supported",
                ));
            }
            _ => {}
        }

        let new_host = refcounts.alloc_clusters(info.cluster_size() as u64)?;

        if copy_on_write && mapping.source == MappingSource::DataFile {
            // carry the shared cluster's content over
            let mut buf = vec![0u8; info.cluster_size()];
            self.file
                .read_exact(mapping.cluster_offset.unwrap(), &mut buf)?;
            self.file.write_all(new_host, &buf)?;
        } else {
            // reused clusters must not leak stale content
            self.file.zero_fill(new_host, info.cluster_size())?;
        }

        let displaced = self
            .l2cache
            .get_mut(l1_index)
            .unwrap()
            .map_cluster(split.l2_index(&info), new_host);
        self.l2cache.set_dirty(l1_index, true);

        // refcounts for the new cluster are already flushed; persist
        // the pointer, then drop the old reference
        self.flush_l2(l1_index)?;

        if let Some((old_offset, old_clusters)) = displaced {
            refcounts.free_clusters(
                old_offset,
                (old_clusters << info.cluster_bits()) as u64,
            )?;
        }

        log::trace!(
            "allocate: guest {:x} -> host {:x} (cow {})",
            guest_offset,
            new_host,
            copy_on_write
        );
        Ok(new_host)
    }

    fn write_l1_header(&mut self, l1_offset: u64, l1_entries: usize) -> Qcow2Result<()> {
        let info = &self.info;

        log::info!(
            "grow_l1: flush header for L1 offset {:x} entries {}",
            l1_offset,
            l1_entries
        );

        assert!(info.in_cluster_offset(l1_offset) == 0);

        let mut h = self.header.borrow_mut();
        let old_entries = h.l1_table_entries();
        let old_offset = h.l1_table_offset();

        h.set_l1_table(l1_offset, l1_entries)?;
        let buf = h.serialize_to_buf()?;
        if let Err(err) = self.file.write_all(0, &buf) {
            h.set_l1_table(old_offset, old_entries)?;
            return Err(err);
        }
        Ok(())
    }

    /// Grow the active L1 table to hold `new_l1_size` entries.
    /// Shrinking is not supported.
    ///
    /// When the enlarged entry count still fits the allocated L1
    /// clusters only the header changes; otherwise a larger table is
    /// written to freshly allocated clusters, the header is repointed
    /// and the old clusters are freed.
    pub fn grow_l1(
        &mut self,
        refcounts: &mut RefcountEngine<T>,
        new_l1_size: usize,
    ) -> Qcow2Result<()> {
        self.ensure_l1_loaded()?;
        let info = Rc::clone(&self.info);

        if new_l1_size <= self.l1table.header_entries() {
            return Ok(());
        }
        if new_l1_size as u64 * 8 > Qcow2Header::MAX_L1_SIZE {
            return Err(Qcow2Error::unsupported("Active L1 table too large"));
        }

        if new_l1_size <= self.l1table.entries() {
            // the tail entries already exist (and are zero) inside the
            // allocated clusters
            let l1_offset = self.l1table.get_offset().unwrap();
            self.write_l1_header(l1_offset, new_l1_size)?;
            self.l1table.update_header_entries(new_l1_size as u32);
            return Ok(());
        }

        let old_offset = self.l1table.get_offset().unwrap();
        let old_clusters = self.l1table.cluster_count(&info);

        let mut new_l1 = self
            .l1table
            .clone_and_grow(new_l1_size - 1, info.cluster_size());
        let new_clusters = new_l1.cluster_count(&info);

        let new_offset =
            refcounts.alloc_clusters((new_clusters << info.cluster_bits()) as u64)?;
        new_l1.set_offset(Some(new_offset));
        new_l1.update_header_entries(new_l1_size as u32);

        log::info!(
            "grow_l1: {} -> {} entries, table {:x} -> {:x}",
            self.l1table.header_entries(),
            new_l1_size,
            old_offset,
            new_offset
        );

        self.file.write_all(new_offset, new_l1.as_bytes())?;
        while new_l1.pop_dirty_blk_idx().is_some() {}

        self.write_l1_header(new_offset, new_l1_size)?;
        self.l1table = new_l1;

        refcounts.free_clusters(old_offset, (old_clusters << info.cluster_bits()) as u64)?;

        Ok(())
    }

    /// Number of L1 entries needed to map `virtual_size` bytes.
    pub fn l1_entries_for_size(info: &Qcow2Info, virtual_size: u64) -> usize {
        let cluster_size = info.cluster_size() as u64;
        div_round_up(virtual_size, cluster_size * info.l2_entries() as u64) as usize
    }
}
