mod integration {
    use qcow2_img::codec;
    use qcow2_img::create::{Qcow2CreateOptions, Qcow2PreallocMode};
    use qcow2_img::dev::{Qcow2Dev, Qcow2DevParams};
    use qcow2_img::error::Qcow2ErrorKind;
    use qcow2_img::meta::MappingSource;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn read_file(path: &std::path::Path) -> Vec<u8> {
        let mut buf = Vec::new();
        std::fs::File::open(path)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    fn write_at(path: &std::path::Path, offset: u64, data: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(data).unwrap();
    }

    fn create_image(opts: &Qcow2CreateOptions) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), opts).unwrap();
        dev.close().unwrap();
        tmp
    }

    #[test]
    fn test_minimal_v3_image_bytes() {
        let mut opts = Qcow2CreateOptions::new(64 << 10);
        opts.preallocation = Qcow2PreallocMode::Metadata;
        let tmp = create_image(&opts);

        let buf = read_file(tmp.path());
        // header (cluster 0), refcount table, refcount block, L1 table
        assert_eq!(buf.len(), 4 * 65536);

        assert_eq!(&buf[0..4], &[0x51, 0x46, 0x49, 0xfb]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 3]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 16]);
        assert_eq!(&buf[24..32], &[0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(&buf[96..100], &[0, 0, 0, 4]);
        assert_eq!(&buf[100..104], &[0, 0, 0, 104]);

        // refcount table entry 0 names the refcount block at cluster 2
        assert_eq!(codec::read_u64(&buf, 65536), 2 * 65536);
        // the four metadata clusters carry refcount 1 each
        for cluster in 0..4usize {
            assert_eq!(codec::read_u16(&buf, 2 * 65536 + cluster * 2), 1);
        }
        // L1 is all zero
        assert!(buf[3 * 65536..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_create_open_round_trip() {
        let mut opts = Qcow2CreateOptions::new(10 << 20);
        opts.cluster_size = 4096;
        opts.refcount_bits = 32;
        let tmp = create_image(&opts);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        let h = dev.header();
        assert_eq!(h.version(), 3);
        assert_eq!(h.size(), 10 << 20);
        assert_eq!(h.cluster_bits(), 12);
        assert_eq!(h.refcount_order(), 5);
        assert_eq!(h.nb_snapshots(), 0);
        assert_eq!(h.crypt_method(), 0);
        assert!(h.backing_filename().is_none());
        // l1_size covers the virtual size
        let l2_coverage = 4096u64 * (4096 / 8);
        assert!(h.l1_table_entries() as u64 * l2_coverage >= 10 << 20);
    }

    #[test]
    fn test_create_v2_image() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.compat = "0.10".to_string();
        let tmp = create_image(&opts);

        let buf = read_file(tmp.path());
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        let h = dev.header();
        assert_eq!(h.version(), 2);
        assert_eq!(h.header_length(), 72);
        assert_eq!(h.refcount_order(), 4);
        assert_eq!(h.compatible_features(), 0);
    }

    #[test]
    fn test_create_encrypted_flag_only() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.encryption = true;
        let tmp = create_image(&opts);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        assert_eq!(dev.header().crypt_method(), 1);
    }

    #[test]
    fn test_create_with_backing_file() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.backing_file = Some("base.qcow2".to_string());
        opts.backing_format = Some("qcow2".to_string());
        let tmp = create_image(&opts);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        assert_eq!(
            dev.header().backing_filename(),
            Some(&"base.qcow2".to_string())
        );
        assert_eq!(dev.header().backing_format(), Some(&"qcow2".to_string()));
        assert!(dev.info().has_back_file());

        // unallocated clusters read through to the parent
        let mapping = dev.get_mapping(65536).unwrap();
        assert_eq!(mapping.source, MappingSource::Backing);
        assert_eq!(mapping.cluster_offset, Some(65536));
    }

    #[test]
    fn test_rejected_compat_level() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.compat = "0.9".to_string();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = Qcow2Dev::create(tmp.path(), &opts).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Invalid);
        assert_eq!(err.to_string(), "Invalid compatibility level: '0.9'");
    }

    #[test]
    fn test_rejected_cluster_size() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.cluster_size = 768;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = Qcow2Dev::create(tmp.path(), &opts).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cluster size must be a power of two between 512 and 2M"
        );
    }

    #[test]
    fn test_rejected_lazy_refcounts_on_v2() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.compat = "0.10".to_string();
        opts.lazy_refcounts = true;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = Qcow2Dev::create(tmp.path(), &opts).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Lazy refcounts only supported with compatibility level 1.1 and above"
        );
    }

    #[test]
    fn test_shrink_is_rejected() {
        let opts = Qcow2CreateOptions::new(1 << 20);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        let err = dev.truncate(512 << 10).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Unsupported);
        assert_eq!(
            err.to_string(),
            "qcow2 doesn't support shrinking images yet"
        );

        let err = dev.truncate((2 << 20) + 7).unwrap_err();
        assert_eq!(err.to_string(), "The new size must be a multiple of 512");

        // same size is a no-op
        dev.truncate(1 << 20).unwrap();
        dev.close().unwrap();
    }

    #[test]
    fn test_resize_with_snapshots_is_rejected() {
        let opts = Qcow2CreateOptions::new(1 << 20);
        let tmp = create_image(&opts);

        // forge a snapshot count into the header
        write_at(tmp.path(), 60, &[0, 0, 0, 1]);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap();
        let err = dev.truncate(2 << 20).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Unsupported);
        assert_eq!(err.to_string(), "Can't resize an image which has snapshots");
    }

    #[test]
    fn test_truncate_updates_header_size() {
        let opts = Qcow2CreateOptions::new(1 << 20);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        dev.truncate(512 << 20).unwrap();
        assert_eq!(dev.virtual_size(), 512 << 20);
        dev.close().unwrap();

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        assert_eq!(dev.virtual_size(), 512 << 20);

        let buf = read_file(tmp.path());
        assert_eq!(codec::read_u64(&buf, 24), 512 << 20);
    }

    #[test]
    fn test_truncate_grows_l1_table() {
        // 512-byte clusters: one L1 cluster maps 2 MiB, so growing to
        // 16 MiB forces a new, larger L1 table
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.cluster_size = 512;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        let old_l1_offset = dev.header().l1_table_offset();
        let old_l1_entries = dev.header().l1_table_entries();
        assert_eq!(old_l1_entries, 32);

        dev.truncate(16 << 20).unwrap();

        let new_l1_offset = dev.header().l1_table_offset();
        let new_l1_entries = dev.header().l1_table_entries();
        assert_eq!(new_l1_entries, 512);
        assert_ne!(new_l1_offset, old_l1_offset);

        // old L1 clusters went back to the free pool
        assert_eq!(dev.refcount(old_l1_offset >> 9).unwrap(), 0);
        // new L1 clusters are live
        let new_l1_clusters = (512u64 * 8 + 511) / 512;
        for i in 0..new_l1_clusters {
            assert_eq!(dev.refcount((new_l1_offset >> 9) + i).unwrap(), 1);
        }
        dev.close().unwrap();

        // growth survives reopen and the map still works
        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap();
        assert_eq!(dev.virtual_size(), 16 << 20);
        let host = dev.allocate_cluster(15 << 20, false).unwrap();
        let mapping = dev.get_mapping(15 << 20).unwrap();
        assert_eq!(mapping.cluster_offset, Some(host));
        dev.close().unwrap();
    }

    #[test]
    fn test_allocate_and_lookup() {
        let opts = Qcow2CreateOptions::new(4 << 20);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        assert_eq!(
            dev.get_mapping(0).unwrap().source,
            MappingSource::Unallocated
        );

        let host = dev.allocate_cluster(0, false).unwrap();
        let mapping = dev.get_mapping(0).unwrap();
        assert_eq!(mapping.source, MappingSource::DataFile);
        assert_eq!(mapping.cluster_offset, Some(host));
        assert!(mapping.copied);
        assert_eq!(mapping.plain_offset(512), Some(host + 512));

        // allocating an exclusively owned cluster is idempotent
        assert_eq!(dev.allocate_cluster(0, false).unwrap(), host);
        assert_eq!(dev.allocate_cluster(100, true).unwrap(), host);

        // the data cluster and its L2 table are refcounted
        assert_eq!(dev.refcount(host >> 16).unwrap(), 1);
        let l2_offset = {
            let h = dev.header();
            let buf = read_file(tmp.path());
            codec::read_u64(&buf, h.l1_table_offset() as usize) & 0x00ff_ffff_ffff_fe00
        };
        assert_eq!(dev.refcount(l2_offset >> 16).unwrap(), 1);
        dev.close().unwrap();

        // mapping survives reopen
        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        let mapping = dev.get_mapping(0).unwrap();
        assert_eq!(mapping.cluster_offset, Some(host));
        assert!(mapping.copied);
    }

    #[test]
    fn test_allocations_are_disjoint() {
        let opts = Qcow2CreateOptions::new(16 << 20);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        let mut hosts = Vec::new();
        for i in 0..16u64 {
            hosts.push(dev.allocate_cluster(i << 16, false).unwrap());
        }

        let mut sorted = hosts.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), hosts.len());

        for host in hosts {
            assert_eq!(dev.refcount(host >> 16).unwrap(), 1);
        }
        dev.close().unwrap();
    }

    #[test]
    fn test_copy_on_write_breaks_sharing() {
        let opts = Qcow2CreateOptions::new(4 << 20);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        let host = dev.allocate_cluster(0, false).unwrap();
        dev.close().unwrap();

        // fill the data cluster with a pattern
        write_at(tmp.path(), host, &[0xabu8; 65536]);

        // forge a snapshot-style shared cluster: clear COPIED in the
        // L2 entry and bump the refcount to 2
        let buf = read_file(tmp.path());
        let l1_offset = codec::read_u64(&buf, 40) as usize;
        let l2_offset = (codec::read_u64(&buf, l1_offset) & 0x00ff_ffff_ffff_fe00) as usize;
        let l2_entry = codec::read_u64(&buf, l2_offset);
        assert_eq!(l2_entry & (1 << 63), 1 << 63);
        let mut shared = [0u8; 8];
        codec::write_u64(&mut shared, 0, l2_entry & !(1 << 63));
        write_at(tmp.path(), l2_offset as u64, &shared);

        let reftable_offset = codec::read_u64(&buf, 48) as usize;
        let refblock_offset = codec::read_u64(&buf, reftable_offset) as usize;
        let cluster_index = (host >> 16) as usize;
        let mut two = [0u8; 2];
        codec::write_u16(&mut two, 0, 2);
        write_at(tmp.path(), (refblock_offset + cluster_index * 2) as u64, &two);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap();
        let mapping = dev.get_mapping(0).unwrap();
        assert_eq!(mapping.source, MappingSource::DataFile);
        assert!(!mapping.copied);

        // copy-on-write allocates a fresh cluster, carries the content
        // over and drops one reference from the old cluster
        let new_host = dev.allocate_cluster(0, true).unwrap();
        assert_ne!(new_host, host);

        let mapping = dev.get_mapping(0).unwrap();
        assert_eq!(mapping.cluster_offset, Some(new_host));
        assert!(mapping.copied);

        assert_eq!(dev.refcount(host >> 16).unwrap(), 1);
        assert_eq!(dev.refcount(new_host >> 16).unwrap(), 1);
        dev.close().unwrap();

        let buf = read_file(tmp.path());
        assert!(buf[new_host as usize..new_host as usize + 65536]
            .iter()
            .all(|b| *b == 0xab));
    }

    #[test]
    fn test_lazy_refcounts_dirty_bit_lifecycle() {
        let mut opts = Qcow2CreateOptions::new(4 << 20);
        opts.lazy_refcounts = true;
        let tmp = tempfile::NamedTempFile::new().unwrap();

        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();
        // the dirty bit is on disk while the image is open read-write
        let buf = read_file(tmp.path());
        assert_eq!(codec::read_u64(&buf, 72) & 1, 1);
        assert_eq!(codec::read_u64(&buf, 80) & 1, 1);

        let host = dev.allocate_cluster(0, false).unwrap();
        dev.close().unwrap();

        // clean close clears it and the batched refcounts hit the disk
        let buf = read_file(tmp.path());
        assert_eq!(codec::read_u64(&buf, 72) & 1, 0);

        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap();
        assert_eq!(dev.refcount(host >> 16).unwrap(), 1);
        dev.close().unwrap();
    }

    #[test]
    fn test_dirty_image_rejected_read_write() {
        let opts = Qcow2CreateOptions::new(1 << 20);
        let tmp = create_image(&opts);

        // set the dirty incompatible bit by hand
        write_at(tmp.path(), 72, &[0, 0, 0, 0, 0, 0, 0, 1]);

        let err = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Unsupported);

        // read-only open is still possible
        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        assert!(dev.header().is_dirty());
    }

    #[test]
    fn test_unknown_autoclear_cleared_on_rw_open() {
        let opts = Qcow2CreateOptions::new(1 << 20);
        let tmp = create_image(&opts);

        write_at(tmp.path(), 88, &[0x80, 0, 0, 0, 0, 0, 0, 2]);

        // read-only open preserves the bits
        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
        assert_ne!(dev.header().autoclear_features(), 0);
        drop(dev);
        let buf = read_file(tmp.path());
        assert_ne!(codec::read_u64(&buf, 88), 0);

        // read-write open clears them on disk
        let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(false)).unwrap();
        assert_eq!(dev.header().autoclear_features(), 0);
        dev.close().unwrap();
        let buf = read_file(tmp.path());
        assert_eq!(codec::read_u64(&buf, 88), 0);
    }

    #[test]
    fn test_narrow_refcount_width() {
        let mut opts = Qcow2CreateOptions::new(1 << 20);
        opts.refcount_bits = 1;
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = Qcow2Dev::create(tmp.path(), &opts).unwrap();

        assert_eq!(dev.info().refcount_bits(), 1);
        assert_eq!(dev.info().refcount_max(), 1);
        for cluster in 0..4 {
            assert_eq!(dev.refcount(cluster).unwrap(), 1);
        }

        let host = dev.allocate_cluster(0, false).unwrap();
        assert_eq!(dev.refcount(host >> 16).unwrap(), 1);
        dev.close().unwrap();
    }

    #[test]
    fn test_not_a_qcow2_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 4096]).unwrap();

        let err = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap_err();
        assert_eq!(err.kind(), Qcow2ErrorKind::Unsupported);
        assert_eq!(err.to_string(), "Image is not in qcow2 format");
    }

    #[test]
    fn test_falloc_and_full_preallocation() {
        for mode in [Qcow2PreallocMode::Falloc, Qcow2PreallocMode::Full] {
            let mut opts = Qcow2CreateOptions::new(1 << 20);
            opts.cluster_size = 4096;
            opts.preallocation = mode;
            let tmp = create_image(&opts);

            let len = std::fs::metadata(tmp.path()).unwrap().len();
            // the whole virtual size plus metadata is reserved
            assert!(len >= 1 << 20, "mode {:?}: len {}", mode, len);

            let dev = Qcow2Dev::open(tmp.path(), &Qcow2DevParams::new(true)).unwrap();
            assert_eq!(dev.virtual_size(), 1 << 20);
        }
    }
}
