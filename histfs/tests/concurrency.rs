use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use histfs::{
    BinarySessionFactory, FileStructureOptions, InMemoryFileStructure, PagePool, SubFileName,
};

const BLOCK_SIZE: usize = 256;
const USABLE: usize = 224;
/// Spans the direct, single and double indirect levels at 56 pointers per node.
const BLOCKS: usize = 150;
const APPENDED: usize = 40;
const READERS: usize = 4;
const WRITERS: usize = 2;

fn structure() -> InMemoryFileStructure {
    let options = FileStructureOptions {
        page_pool: Some(PagePool::new(BLOCK_SIZE).unwrap()),
        ..FileStructureOptions::with_block_size(BLOCK_SIZE)
    };
    InMemoryFileStructure::create_in_memory(options).unwrap()
}

fn committed_pattern(v: usize) -> u8 {
    v as u8
}

fn edited_pattern(v: usize) -> u8 {
    !(v as u8)
}

#[test]
fn test_snapshot_readers_run_alongside_edit() {
    let fs = structure();
    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(SubFileName::from_label("tags")).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    for v in 0..BLOCKS {
        bs.write_all(&[committed_pattern(v); USABLE]).unwrap();
    }
    drop(bs);
    drop(stream);
    edit.commit().unwrap();

    let before = fs.snapshot().unwrap();
    let reader_stream = before.open_file(0).unwrap();
    let committed = AtomicBool::new(false);
    let passes = AtomicUsize::new(0);
    let start = Barrier::new(READERS + 1);

    thread::scope(|s| {
        for _ in 0..READERS {
            s.spawn(|| {
                let mut bs = reader_stream.create_binary_stream().unwrap();
                let mut buf = [0u8; USABLE];
                start.wait();
                loop {
                    // A pass that starts after the commit is fully post-commit.
                    let after_commit = committed.load(Ordering::SeqCst);
                    bs.set_position(0);
                    for v in 0..BLOCKS {
                        bs.read_exact(&mut buf).unwrap();
                        assert_eq!(buf, [committed_pattern(v); USABLE], "block {}", v);
                    }
                    passes.fetch_add(1, Ordering::SeqCst);
                    if after_commit {
                        break;
                    }
                }
            });
        }

        start.wait();
        let edit = fs.begin_edit().unwrap();
        let stream = edit.open_file(0).unwrap();
        thread::scope(|w| {
            for writer in 0..WRITERS {
                let stream = &stream;
                w.spawn(move || {
                    let mut bs = stream.create_binary_stream().unwrap();
                    for v in (writer..BLOCKS).step_by(WRITERS) {
                        bs.set_position((v * USABLE) as i64);
                        bs.write_all(&[edited_pattern(v); USABLE]).unwrap();
                    }
                    if writer == 0 {
                        bs.set_position((BLOCKS * USABLE) as i64);
                        bs.write_all(&[0x77; APPENDED * USABLE]).unwrap();
                    }
                });
            }
        });
        drop(stream);
        edit.commit().unwrap();
        committed.store(true, Ordering::SeqCst);
    });
    assert!(passes.load(Ordering::SeqCst) >= READERS);

    let after = fs.snapshot().unwrap();
    assert_eq!(after.files()[0].data_block_count as usize, BLOCKS + APPENDED);
    let stream = after.open_file(0).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    let mut buf = [0u8; USABLE];
    for v in 0..BLOCKS {
        bs.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [edited_pattern(v); USABLE], "block {}", v);
    }
    for _ in 0..APPENDED {
        bs.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x77; USABLE]);
    }
    assert!(fs.verify().unwrap().is_empty());

    // The old snapshot is still intact.
    let mut old = reader_stream.create_binary_stream().unwrap();
    old.set_position((BLOCKS as i64 - 1) * USABLE as i64);
    old.read_exact(&mut buf).unwrap();
    assert_eq!(buf, [committed_pattern(BLOCKS - 1); USABLE]);
}

#[test]
fn test_parallel_writers_share_shadow_copies() {
    let fs = structure();
    let edit = fs.begin_edit().unwrap();
    let stream = edit.create_file(SubFileName::from_label("grid")).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    bs.write_all(&vec![0u8; BLOCKS * USABLE]).unwrap();
    drop(bs);
    drop(stream);
    edit.commit().unwrap();
    let committed = fs.committed_header();

    let edit = fs.begin_edit().unwrap();
    let stream = Arc::new(edit.open_file(0).unwrap());
    let threads: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                let mut bs = stream.create_binary_stream().unwrap();
                for v in (writer..BLOCKS).step_by(WRITERS) {
                    bs.set_position((v * USABLE) as i64);
                    bs.write_u32(v as u32).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // Every committed block was copied once: the tree nodes plus every data
    // block, and nothing else.
    let nodes = committed.files[0].total_block_count - committed.files[0].data_block_count;
    let copied = edit.last_allocated_block() - committed.last_allocated_block;
    assert_eq!(copied, nodes + BLOCKS as u32);

    drop(stream);
    edit.commit().unwrap();
    assert!(fs.verify().unwrap().is_empty());
    let snapshot = fs.snapshot().unwrap();
    let stream = snapshot.open_file(0).unwrap();
    let mut bs = stream.create_binary_stream().unwrap();
    for v in 0..BLOCKS {
        bs.set_position((v * USABLE) as i64);
        assert_eq!(bs.read_u32().unwrap(), v as u32);
    }
}
