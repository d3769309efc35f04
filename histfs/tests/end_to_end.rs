use std::sync::Arc;

use histfs::{
    BinarySessionFactory, FileStructureOptions, HistError, InMemoryFileStructure, PagePool,
    SessionRole, SubFileName,
};

fn structure(block_size: usize) -> (InMemoryFileStructure, Arc<PagePool>) {
    let pool = PagePool::new(block_size).unwrap();
    let options = FileStructureOptions {
        page_pool: Some(Arc::clone(&pool)),
        ..FileStructureOptions::with_block_size(block_size)
    };
    (InMemoryFileStructure::create_in_memory(options).unwrap(), pool)
}

#[test]
fn test_twenty_million_words_round_trip() {
    const WORDS: u64 = 20_000_000;
    let (fs, _pool) = structure(256);
    let name = SubFileName::from_label("words");

    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(name).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    for i in 0..WORDS {
        bs.write_u64(i.wrapping_mul(0x9E37_79B9_7F4A_7C15)).unwrap();
    }
    assert_eq!(bs.position() as u64, WORDS * 8);
    drop(bs);
    drop(stream);
    edit.commit().unwrap();

    let snapshot = fs.snapshot().unwrap();
    let stream = snapshot.open_file_by_name(&name).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    for i in 0..WORDS {
        assert_eq!(bs.read_u64().unwrap(), i.wrapping_mul(0x9E37_79B9_7F4A_7C15), "word {}", i);
    }

    // 224 usable bytes per block: 160 MB spills into the quadruple level.
    let file = snapshot.files()[0];
    assert_eq!(file.data_block_count as u64, (WORDS * 8).div_ceil(224));
    assert_ne!(file.quadruple_indirect_block(), 0);
}

#[test]
fn test_snapshot_isolation_for_open_sessions() {
    let (fs, _pool) = structure(256);
    let usable = 224i64;

    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(SubFileName::from_label("iso")).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    bs.write_all(&vec![0xAA; 10 * usable as usize]).unwrap();
    drop(bs);
    drop(stream);
    edit.commit().unwrap();

    let before = fs.snapshot().unwrap();
    let reader_stream = before.open_file(0).unwrap();
    let mut first = reader_stream.create_io_session().unwrap();
    let mut second = reader_stream.create_binary_stream().unwrap();
    let old_physical = first.get_block(5 * usable, false).unwrap().physical_block;

    let edit = fs.begin_edit().unwrap();
    let stream = edit.open_file(0).unwrap();
    let mut writer = stream.create_io_session().unwrap();
    let args = writer.get_block(5 * usable, true).unwrap();
    assert_ne!(args.physical_block, old_physical);
    writer.write_at(0, &[0x55; 224]).unwrap();
    drop(writer);
    drop(stream);
    edit.commit().unwrap();

    // Sessions opened before the edit still see the old block.
    let mut buf = [0u8; 224];
    first.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0xAA; 224]);
    let args = first.get_block(5 * usable, false).unwrap();
    assert_eq!(args.physical_block, old_physical);
    first.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, [0xAA; 224]);

    second.set_position(5 * usable);
    second.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [0xAA; 224]);

    // A session on the new snapshot sees the edit.
    let after = fs.snapshot().unwrap();
    let fresh_stream = after.open_file(0).unwrap();
    let mut fresh = fresh_stream.create_binary_stream().unwrap();
    fresh.set_position(5 * usable);
    fresh.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [0x55; 224]);
    fresh.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [0xAA; 224], "block 6 is untouched");
}

#[test]
fn test_missing_block_beyond_file_size() {
    let (fs, _pool) = structure(256);
    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(SubFileName::from_label("short")).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    bs.write_all(&[1u8; 300]).unwrap();
    drop(bs);
    drop(stream);
    edit.commit().unwrap();

    let snapshot = fs.snapshot().unwrap();
    let stream = snapshot.open_file(0).unwrap();
    let mut session = stream.create_io_session().unwrap();
    assert!(session.get_block(224, false).is_ok());
    assert!(matches!(
        session.get_block(2 * 224, false),
        Err(HistError::MissingBlock { virtual_block: 2 })
    ));
    assert!(matches!(
        session.get_block(1_000_000, false),
        Err(HistError::MissingBlock { .. })
    ));

    let Some(SessionRole::ReadOnly(parser)) = session.role_mut() else {
        panic!("snapshot sessions are read-only");
    };
    assert_eq!(parser.virtual_to_physical(2).unwrap(), 0);

    let mut bs = stream.create_binary_stream().unwrap();
    bs.set_position(299);
    assert_eq!(bs.read_u8().unwrap(), 1);
    bs.set_position(2 * 224 - 1);
    assert_eq!(bs.read_u8().unwrap(), 0, "tail of the last block reads as zero");
    assert!(matches!(bs.read_u8(), Err(HistError::MissingBlock { .. })));
}
