use crate::cache::Qcow2Cache;
use crate::dev::Qcow2Info;
use crate::error::{Qcow2Error, Qcow2Result};
use crate::file::Qcow2ImageFile;
use crate::helpers::div_round_up;
use crate::meta::{
    HostCluster, Qcow2Header, RefBlock, RefTable, RefTableEntry, Table, TableEntry, BLOCK_SIZE,
};
use crate::numerical_enum;
use crate::ops::Qcow2IoOps;
use std::cell::RefCell;
use std::rc::Rc;

numerical_enum! {
    /// Hint describing why a refcount dropped to zero.  The core does
    /// not pass discards to the host; the hint is recorded in the log
    /// only.
    pub enum Qcow2DiscardType as u8 {
        Never = 0,
        Always = 1,
        Request = 2,
        Snapshot = 3,
        Other = 4,
    }
}

/// Maps every host cluster to its reference count, hands out free
/// clusters and grows the refcount metadata as the image grows.
///
/// The engine is recursively consistent: the clusters occupied by the
/// refcount table and each refcount block themselves carry refcount 1.
pub struct RefcountEngine<T> {
    file: Rc<Qcow2ImageFile<T>>,
    header: Rc<RefCell<Qcow2Header>>,
    info: Rc<Qcow2Info>,

    reftable: RefTable,
    rb_cache: Qcow2Cache<RefBlock>,

    /// Cursor into the refcount space where the next free-cluster scan
    /// starts.
    free_cluster_index: u64,
}

impl<T: Qcow2IoOps> RefcountEngine<T> {
    pub(crate) fn new(
        file: Rc<Qcow2ImageFile<T>>,
        header: Rc<RefCell<Qcow2Header>>,
        info: Rc<Qcow2Info>,
    ) -> Self {
        let rt_size = header.borrow().reftable_clusters() << info.cluster_bits();
        let rb_cache_cnt = info.rb_cache_cnt;

        RefcountEngine {
            file,
            header,
            info,
            reftable: RefTable::new(None, rt_size),
            rb_cache: Qcow2Cache::new(rb_cache_cnt),
            free_cluster_index: 0,
        }
    }

    /// The refcount table is loaded on first use, not at open.
    fn ensure_reftable_loaded(&mut self) -> Qcow2Result<()> {
        if self.reftable.is_update() {
            return Ok(());
        }

        let offset = self.header.borrow().reftable_offset();
        self.reftable.set_offset(Some(offset));
        self.file
            .read_exact(offset, self.reftable.as_bytes_mut())
            .map_err(|e| e.prepend("load refcount table"))?;

        log::debug!(
            "loaded refcount table: offset {:x} entries {}",
            offset,
            self.reftable.entries()
        );
        Ok(())
    }

    fn insert_refblock(&mut self, rt_index: usize, rb: RefBlock) -> Qcow2Result<()> {
        if let Some((victim_key, victim)) = self.rb_cache.put(rt_index, rb) {
            let offset = victim.get_offset().ok_or_else(|| {
                Qcow2Error::corrupt("dirty refcount block without backing offset")
            })?;
            log::debug!("write back evicted refblock {} at {:x}", victim_key, offset);
            self.file.write_all(offset, victim.as_bytes())?;
        }
        Ok(())
    }

    /// Load the refcount block named by a non-empty reftable entry.
    fn load_refblock(&mut self, rt_index: usize) -> Qcow2Result<()> {
        if self.rb_cache.contains_key(rt_index) {
            return Ok(());
        }

        let rt_e = RefTableEntry::try_from_plain(
            self.reftable.get(rt_index).into_plain(),
            &self.info,
        )?;
        debug_assert!(!rt_e.is_zero());

        let offset = rt_e.refblock_offset();
        let mut rb = RefBlock::new(
            self.info.refcount_order(),
            self.info.cluster_size(),
            Some(offset),
        );
        self.file
            .read_exact(offset, rb.as_bytes_mut())
            .map_err(|e| e.prepend("load refcount block"))?;

        self.insert_refblock(rt_index, rb)
    }

    /// Make sure the reftable entry `rt_index` points to a valid,
    /// cached refcount block, materializing one when the range is
    /// still uncovered.
    ///
    /// A fresh block is placed at the first cluster of its own covered
    /// range and describes itself: its refcount (1) is set inside the
    /// block before the reftable entry is published.  An uncovered
    /// range cannot contain allocated clusters, so that cluster is
    /// known to be free.
    fn ensure_refblock(&mut self, rt_index: usize) -> Qcow2Result<()> {
        self.ensure_reftable_loaded()?;

        if !self.reftable.in_bounds(rt_index) {
            self.grow_reftable(rt_index)?;
        }

        if !self.reftable.get(rt_index).is_zero() {
            return self.load_refblock(rt_index);
        }

        let info = &self.info;
        let refblock_offset =
            (rt_index as u64) << (info.rb_index_shift + info.cluster_shift);
        log::debug!("allocate new refblock at {:x}", refblock_offset);

        let mut rb = RefBlock::new(
            info.refcount_order(),
            info.cluster_size(),
            Some(refblock_offset),
        );
        rb.increment(0)?;

        self.reftable.set_refblock_offset(rt_index, refblock_offset);
        self.insert_refblock(rt_index, rb)?;
        self.rb_cache.set_dirty(rt_index, true);
        Ok(())
    }

    // If we are running out of reftable, allocate more clusters and
    // replace the current refcount table with a larger one.
    //
    // The new refcount block and the new table live in the first range
    // beyond current coverage; both are on disk before the header
    // points at them, and the old table clusters are freed last.
    //
    // Very slow code path.
    fn grow_reftable(&mut self, at_least_index: usize) -> Qcow2Result<()> {
        let info = Rc::clone(&self.info);
        let cluster_size = info.cluster_size();

        let mut grown_rt = self
            .reftable
            .clone_and_grow(at_least_index, cluster_size);
        let new_rt_clusters = grown_rt.cluster_count(&info);

        if new_rt_clusters as u64 * cluster_size as u64 > Qcow2Header::MAX_REFTABLE_SIZE {
            return Err(Qcow2Error::unsupported(
                "Refcount table cannot grow past 8 MiB",
            ));
        }
        if new_rt_clusters >= info.rb_entries() - 1 {
            // 1 entry stays free so the new refblock can hold its own
            // refcount
            return Err(Qcow2Error::unsupported(format!(
                "The reftable needs to grow to {} bytes, but we can allocate only {} -- try \
                 increasing the cluster size",
                new_rt_clusters * cluster_size,
                (info.rb_entries() - 1) * cluster_size,
            )));
        }

        let old_rt_offset = self.reftable.get_offset().unwrap();
        let old_rt_clusters = self.reftable.cluster_count(&info);
        let old_entries = self.reftable.entries();

        let refblock_offset =
            (old_entries as u64) << (info.rb_index_shift + info.cluster_shift);
        let rt_offset = refblock_offset + cluster_size as u64;
        grown_rt.set_offset(Some(rt_offset));

        log::info!(
            "grow reftable: entries {} -> {}, new table at {:x}",
            old_entries,
            grown_rt.entries(),
            rt_offset
        );

        let mut new_refblock = RefBlock::new(
            info.refcount_order(),
            cluster_size,
            Some(refblock_offset),
        );
        // Reference for the refblock
        new_refblock.increment(0)?;
        // References for the reftable
        for i in 1..(new_rt_clusters + 1) {
            new_refblock.increment(i)?;
        }

        grown_rt.set_refblock_offset(old_entries, refblock_offset);

        // block and table reach the disk before the header names them
        self.file
            .write_all(refblock_offset, new_refblock.as_bytes())?;
        self.file.write_all(rt_offset, grown_rt.as_bytes())?;
        while grown_rt.pop_dirty_blk_idx().is_some() {}

        {
            let mut h = self.header.borrow_mut();
            let (roll_off, roll_clusters) = (h.reftable_offset(), h.reftable_clusters());

            h.set_reftable(rt_offset, new_rt_clusters)?;
            let buf = h.serialize_to_buf()?;
            if let Err(err) = self.file.write_all(0, &buf) {
                h.set_reftable(roll_off, roll_clusters)?;
                return Err(err);
            }
        }

        self.insert_refblock(old_entries, new_refblock)?;
        self.reftable = grown_rt;

        self.free_clusters(old_rt_offset, (old_rt_clusters << info.cluster_bits()) as u64)?;

        Ok(())
    }

    /// Refcount of `host_cluster_index`; clusters outside the covered
    /// range report 0.
    pub fn get(&mut self, host_cluster_index: u64) -> Qcow2Result<u64> {
        self.ensure_reftable_loaded()?;

        let info = &self.info;
        let rt_index = (host_cluster_index >> info.rb_index_shift) as usize;
        let rb_index = host_cluster_index as usize & info.rb_index_mask;

        if !self.reftable.in_bounds(rt_index) || self.reftable.get(rt_index).is_zero() {
            return Ok(0);
        }

        self.load_refblock(rt_index)?;
        Ok(self.rb_cache.get(rt_index).unwrap().get(rb_index))
    }

    /// Apply `delta` to one cluster's refcount inside its (possibly
    /// freshly created) refcount block.  The new value is returned;
    /// the block stays dirty in cache until [`Self::flush`].
    fn adjust(&mut self, host_cluster_index: u64, delta: i64) -> Qcow2Result<u64> {
        let info = Rc::clone(&self.info);
        let rt_index = (host_cluster_index >> info.rb_index_shift) as usize;
        let rb_index = host_cluster_index as usize & info.rb_index_mask;

        self.ensure_refblock(rt_index)?;

        let refcount_max = info.refcount_max();
        let rb = self.rb_cache.get_mut(rt_index).unwrap();
        let old = rb.get(rb_index);

        let new = if delta >= 0 {
            let new = old.checked_add(delta as u64).ok_or_else(|| {
                Qcow2Error::refcount_overflow(format!(
                    "Cannot increase refcount beyond {}",
                    refcount_max
                ))
            })?;
            if new > refcount_max {
                return Err(Qcow2Error::refcount_overflow(format!(
                    "Cannot increase refcount beyond {} with refcount_bits={}",
                    refcount_max,
                    info.refcount_bits()
                )));
            }
            new
        } else {
            old.checked_sub((-delta) as u64).ok_or_else(|| {
                Qcow2Error::refcount_underflow("Cannot decrease refcount below 0")
            })?
        };

        rb.set(rb_index, new)?;
        self.rb_cache.set_dirty(rt_index, true);
        Ok(new)
    }

    /// Atomic per-block refcount modification for a single host
    /// cluster.
    pub fn update(
        &mut self,
        host_cluster_index: u64,
        delta: i64,
        discard_type: Qcow2DiscardType,
    ) -> Qcow2Result<u64> {
        let new = self.adjust(host_cluster_index, delta)?;

        if new == 0 && delta < 0 {
            log::debug!(
                "cluster {} became free (discard hint {:?})",
                host_cluster_index,
                discard_type
            );
            self.free_cluster_index = std::cmp::min(self.free_cluster_index, host_cluster_index);
        }

        if !self.info.use_lazy_refcounts() {
            self.flush()?;
        }
        Ok(new)
    }

    /// Allocate `ceil(n_bytes / cluster_size)` contiguous clusters and
    /// set each refcount to 1.  Returns the host byte offset of the
    /// first cluster.
    pub fn alloc_clusters(&mut self, n_bytes: u64) -> Qcow2Result<u64> {
        let info = Rc::clone(&self.info);
        let count = div_round_up(n_bytes, info.cluster_size() as u64) as usize;
        assert!(count > 0);

        self.ensure_reftable_loaded()?;

        let mut start = self.free_cluster_index;
        let mut run = 0usize;
        let mut idx = start;

        while run < count {
            // keep the scan inside covered space so self-describing
            // refblocks show up as allocated
            let rt_index = (idx >> info.rb_index_shift) as usize;
            self.ensure_refblock(rt_index)?;

            let rb_index = idx as usize & info.rb_index_mask;
            if self.rb_cache.get(rt_index).unwrap().is_free(rb_index) {
                run += 1;
            } else {
                run = 0;
                start = idx + 1;
            }
            idx += 1;
        }

        for i in start..start + count as u64 {
            self.adjust(i, 1)?;
        }

        // Advance the cursor only for count == 1, because otherwise
        // (count > 1) we might have the index skip holes where single
        // clusters could still fit
        if count == 1 {
            self.free_cluster_index = std::cmp::max(self.free_cluster_index, start + 1);
        }

        if !info.use_lazy_refcounts() {
            self.flush()?;
        }

        let host_offset = start << info.cluster_shift;
        log::trace!(
            "alloc_clusters: {} clusters at {:x} (cursor {})",
            count,
            host_offset,
            self.free_cluster_index
        );
        Ok(host_offset)
    }

    /// Decrement the refcounts of `ceil(n_bytes / cluster_size)`
    /// clusters starting at `host_offset`; counts reaching 0 make the
    /// clusters available to a later [`Self::alloc_clusters`].
    pub fn free_clusters(&mut self, host_offset: u64, n_bytes: u64) -> Qcow2Result<()> {
        let info = Rc::clone(&self.info);
        let count = div_round_up(n_bytes, info.cluster_size() as u64);
        let first = HostCluster(host_offset).cluster_index(&info);

        log::info!("free_clusters start {:x} num {}", host_offset, count);

        for i in first..first + count {
            let new = self.adjust(i, -1)?;
            if new == 0 {
                self.free_cluster_index = std::cmp::min(self.free_cluster_index, i);
            }
        }

        if !info.use_lazy_refcounts() {
            self.flush()?;
        }
        Ok(())
    }

    /// Write out all dirty refcount blocks, then the dirty sectors of
    /// the refcount table.
    pub fn flush(&mut self) -> Qcow2Result<()> {
        for key in self.rb_cache.dirty_keys() {
            let rb = self.rb_cache.peek(key).unwrap();
            let offset = rb.get_offset().ok_or_else(|| {
                Qcow2Error::corrupt("dirty refcount block without backing offset")
            })?;
            self.file.write_all(offset, rb.as_bytes())?;
            self.rb_cache.set_dirty(key, false);
        }

        if let Some(rt_offset) = self.reftable.get_offset() {
            while let Some(blk) = self.reftable.pop_dirty_blk_idx() {
                let start = blk as usize * BLOCK_SIZE;
                let end = std::cmp::min(start + BLOCK_SIZE, self.reftable.byte_size());
                self.file.write_all(
                    rt_offset + start as u64,
                    &self.reftable.as_bytes()[start..end],
                )?;
            }
        }

        Ok(())
    }
}
