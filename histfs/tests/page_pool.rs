use histfs::page_pool::{default_pool, shutdown_default_pools};
use histfs::{BinarySessionFactory, FileStructureOptions, HistError, InMemoryFileStructure, SubFileName};

// Kept alone in this binary: it tears down the process-wide pools.
#[test]
fn test_default_pool_lifecycle() {
    let fs = InMemoryFileStructure::create_in_memory(FileStructureOptions::with_block_size(512))
        .unwrap();
    let pool = default_pool(512).unwrap();
    assert!(std::sync::Arc::ptr_eq(fs.page_pool(), &pool));

    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(SubFileName::from_label("pooled")).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    bs.write_all(&[3u8; 5_000]).unwrap();
    drop(bs);
    drop(stream);
    edit.commit().unwrap();
    assert!(pool.in_use_pages() > 0);

    drop(fs);
    assert_eq!(pool.in_use_pages(), 0);
    assert!(pool.free_pages() > 0);

    shutdown_default_pools();
    assert!(pool.is_shut_down());
    assert_eq!(pool.free_pages(), 0);
    assert!(matches!(pool.allocate(), Err(HistError::PoolShutdown)));

    // The next request starts a fresh pool.
    let fresh = default_pool(512).unwrap();
    assert!(!std::sync::Arc::ptr_eq(&fresh, &pool));
    assert!(fresh.allocate().is_ok());
}
