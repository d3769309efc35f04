use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use histfs::{
    BinarySessionFactory, FileStructureOnDisk, FileStructureOptions, HistError, OpenMode, PagePool,
    SubFileName,
};
use tempfile::tempdir;

fn options(block_size: usize) -> FileStructureOptions {
    FileStructureOptions {
        page_pool: Some(PagePool::new(block_size).unwrap()),
        ..FileStructureOptions::with_block_size(block_size)
    }
}

fn write_values(fs: &FileStructureOnDisk, name: &str, values: &[u64]) {
    let edit = fs.begin_edit().unwrap();
    let name = SubFileName::from_label(name);
    let stream = match edit.open_file_by_name(&name) {
        Ok(stream) => stream,
        Err(HistError::NotFound(_)) => edit.create_file(name).unwrap(),
        Err(e) => panic!("{}", e),
    };
    let mut bs = stream.create_binary_stream().unwrap();
    for v in values {
        bs.write_u64(*v).unwrap();
    }
    drop(bs);
    drop(stream);
    edit.commit().unwrap();
}

fn read_values(fs: &FileStructureOnDisk, name: &str, count: usize) -> Vec<u64> {
    let snapshot = fs.snapshot().unwrap();
    let stream = snapshot.open_file_by_name(&SubFileName::from_label(name)).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    (0..count).map(|_| bs.read_u64().unwrap()).collect()
}

fn patch_file(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

#[test]
fn test_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("archive.hfs");
    let first: Vec<u64> = (0..5_000).collect();
    let second: Vec<u64> = (0..5_000).map(|v| v * 3).collect();

    {
        let fs = FileStructureOnDisk::create_file(&path, options(512)).unwrap();
        write_values(&fs, "first", &first);
        write_values(&fs, "second", &second);

        // Never committed.
        let edit = fs.begin_edit().unwrap();
        let stream = edit.open_file(0).unwrap();
        let mut bs = stream.create_binary_stream().unwrap();
        bs.write_u64(u64::MAX).unwrap();
        edit.create_file(SubFileName::from_label("third")).unwrap();
    }

    let fs = FileStructureOnDisk::open_file(&path, OpenMode::Write, options(512)).unwrap();
    assert_eq!(fs.block_size(), 512);
    assert_eq!(fs.committed_header().snapshot_sequence, 2);
    assert_eq!(fs.snapshot().unwrap().files().len(), 2);
    assert_eq!(read_values(&fs, "first", first.len()), first);
    assert_eq!(read_values(&fs, "second", second.len()), second);
    assert!(fs.verify().unwrap().is_empty());

    // Extend after reopen.
    write_values(&fs, "first", &[42]);
    assert_eq!(read_values(&fs, "first", 2), vec![42, 1]);
    assert!(fs.verify().unwrap().is_empty());
}

#[test]
fn test_block_size_comes_from_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sized.hfs");
    drop(FileStructureOnDisk::create_file(&path, options(1024)).unwrap());

    let fs = FileStructureOnDisk::open_file(&path, OpenMode::Read, FileStructureOptions::default())
        .unwrap();
    assert_eq!(fs.block_size(), 1024);
    assert!(matches!(
        FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)),
        Err(HistError::InvalidArgument(_))
    ));
}

#[test]
fn test_rollback_restores_committed_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rollback.hfs");
    let fs = FileStructureOnDisk::create_file(&path, options(256)).unwrap();
    write_values(&fs, "points", &(0..100).collect::<Vec<_>>());
    let committed = fs.committed_header();

    let edit = fs.begin_edit().unwrap();
    let stream = edit.open_file(0).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    for _ in 0..100 {
        bs.write_u64(0).unwrap();
    }
    assert!(edit.last_allocated_block() > committed.last_allocated_block);
    drop(bs);
    drop(stream);
    edit.rollback();

    assert_eq!(fs.committed_header().last_allocated_block, committed.last_allocated_block);
    assert_eq!(read_values(&fs, "points", 100), (0..100).collect::<Vec<_>>());

    let edit = fs.begin_edit().unwrap();
    assert_eq!(edit.last_allocated_block(), committed.last_allocated_block);
    assert_eq!(edit.snapshot_sequence(), committed.snapshot_sequence + 1);
}

#[test]
fn test_verify_reports_corrupted_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.hfs");
    let direct = {
        let fs = FileStructureOnDisk::create_file(&path, options(256)).unwrap();
        write_values(&fs, "points", &(0..200).collect::<Vec<_>>());
        assert!(fs.verify().unwrap().is_empty());
        fs.snapshot().unwrap().files()[0].direct_block()
    };

    // A byte inside the footer of the direct block.
    patch_file(&path, direct as u64 * 256 + 256 - 20);

    let fs = FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)).unwrap();
    let issues = fs.verify().unwrap();
    assert_eq!(issues.len(), 1, "{:?}", issues);
    assert!(issues[0].contains(&format!("corrupt block {}", direct)), "{:?}", issues);
}

#[test]
fn test_falls_back_to_older_header_slot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("slots.hfs");
    {
        let fs = FileStructureOnDisk::create_file(&path, options(256)).unwrap();
        write_values(&fs, "points", &[1, 2, 3]);
        write_values(&fs, "points", &[7]);
        assert_eq!(fs.committed_header().snapshot_sequence, 2);
    }

    // Sequence 2 lives in slot 0.
    patch_file(&path, 100);

    let fs = FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)).unwrap();
    assert_eq!(fs.committed_header().snapshot_sequence, 1);
    assert_eq!(read_values(&fs, "points", 3), vec![1, 2, 3]);
}

#[test]
fn test_read_only_and_locking() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.hfs");
    assert!(matches!(
        FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)),
        Err(HistError::Io(_))
    ));
    drop(FileStructureOnDisk::create_file(&path, options(256)).unwrap());
    assert!(matches!(
        FileStructureOnDisk::create_file(&path, options(256)),
        Err(HistError::AlreadyExists(_))
    ));

    let reader = FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)).unwrap();
    assert!(matches!(reader.begin_edit(), Err(HistError::ReadOnly(_))));
    let second_reader = FileStructureOnDisk::open_file(&path, OpenMode::Read, options(256)).unwrap();
    assert!(matches!(
        FileStructureOnDisk::open_file(&path, OpenMode::Write, options(256)),
        Err(HistError::LockConflict(_))
    ));
    drop(reader);
    drop(second_reader);
    assert!(FileStructureOnDisk::open_file(&path, OpenMode::Write, options(256)).is_ok());
}
