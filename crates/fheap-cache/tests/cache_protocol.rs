//! Protocol-level behavior driven through the in-memory cache manager:
//! speculative header loads, flush ordering, address promotion, and
//! flush-dependency edge lifecycle.

use fheap_cache::cache::PROVISIONAL_BASE;
use fheap_cache::heap::{FractalHeap, HeapParams};
use fheap_cache::{HeapError, NotifyAction, Parent};
use fheap_format::FilterSpec;
use pretty_assertions::assert_eq;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn trace_init() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn filtered_params() -> HeapParams {
    HeapParams {
        filter: Some(FilterSpec::Deflate { level: 6 }),
        ..HeapParams::default()
    }
}

#[test]
fn flush_promotes_root_dblock_and_header_records_it() {
    trace_init();
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[7u8; 64]).unwrap();

    let provisional = heap.cache().header().table.table_addr.unwrap();
    assert!(provisional >= PROVISIONAL_BASE);

    heap.cache_mut().flush_all().unwrap();

    let durable = heap.cache().header().table.table_addr.unwrap();
    assert!(durable < PROVISIONAL_BASE, "root still provisional after flush");
    assert!(heap.cache().disk_image(durable).is_some());
    assert!(heap.cache().disk_image(heap.heap_addr()).is_some());
    assert!(!heap.cache().is_resident(provisional));
    assert!(heap.cache().is_resident(durable));

    // Everything is clean; a second flush writes nothing new
    let status = heap.cache().get_entry_status(durable);
    assert!(status.in_cache && !status.dirty);
    heap.cache_mut().flush_all().unwrap();
}

#[test]
fn dependency_edges_follow_insert_flush_evict() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[1u8; 32]).unwrap();
    let heap_addr = heap.heap_addr();
    let root = heap.cache().header().table.table_addr.unwrap();

    // Insertion registered the header -> root edge
    assert_eq!(heap.cache().deps.parent_of(root), Some(heap_addr));
    let status = heap.cache().get_entry_status(heap_addr);
    assert!(status.flush_dep_parent);

    heap.cache_mut().flush_all().unwrap();
    let root = heap.cache().header().table.table_addr.unwrap();
    // Promotion re-keyed the edge to the durable address
    assert_eq!(heap.cache().deps.parent_of(root), Some(heap_addr));

    heap.cache_mut().evict(root).unwrap();
    assert!(!heap.cache().deps.is_flush_dep_parent(heap_addr));
    assert!(!heap.cache().is_resident(root));
}

#[test]
fn eviction_uses_parent_snapshot_after_live_parent_cleared() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[1u8; 32]).unwrap();
    heap.cache_mut().flush_all().unwrap();
    let heap_addr = heap.heap_addr();
    let root = heap.cache().header().table.table_addr.unwrap();

    // Clear the live parent; the snapshot captured at insert remains
    heap.cache_mut().dblock_mut(root).unwrap().parent = None;
    assert_eq!(heap.cache().deps.parent_of(root), Some(heap_addr));

    heap.cache_mut().evict(root).unwrap();
    assert!(!heap.cache().deps.is_flush_dep_parent(heap_addr));
}

#[test]
#[should_panic(expected = "dependency child")]
fn header_flush_with_dirty_child_panics() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[1u8; 32]).unwrap();
    // The root direct block is still dirty
    let _ = heap.cache_mut().flush_header();
}

#[test]
#[should_panic(expected = "diverged from snapshot")]
fn registration_with_diverged_parent_panics() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[1u8; 32]).unwrap();
    heap.cache_mut().flush_all().unwrap();
    let root = heap.cache().header().table.table_addr.unwrap();

    let mut db = heap.cache_mut().dblock_mut(root).unwrap().clone();
    db.parent = Some(Parent::Indirect { addr: 0x4242, entry: 3 });
    let hdr = heap.cache().header().clone();
    let mut graph = fheap_cache::deps::FlushDependencyGraph::new();
    db.notify(NotifyAction::AfterInsert, &hdr, &mut graph);
}

#[test]
fn speculative_header_reload_round_trips() {
    trace_init();
    let mut heap = FractalHeap::create(filtered_params()).unwrap();
    heap.insert(&[9u8; 200]).unwrap();
    heap.cache_mut().flush_all().unwrap();

    let heap_addr = heap.heap_addr();
    let before = heap.cache().header().clone();
    let root = before.table.table_addr.unwrap();

    let cache = heap.cache_mut();
    cache.evict(root).unwrap();
    cache.evict_header();
    cache.load_header(heap_addr).unwrap();

    let after = cache.header();
    assert_eq!(after.stats, before.stats);
    assert_eq!(after.table, before.table);
    assert_eq!(after.filter, before.filter);
    assert_eq!(after.image_len(), before.image_len());
}

#[test]
fn filtered_root_block_reloads_through_parent_record() {
    let mut heap = FractalHeap::create(filtered_params()).unwrap();
    heap.insert(&[42u8; 300]).unwrap();
    heap.cache_mut().flush_all().unwrap();

    let root = heap.cache().header().table.table_addr.unwrap();
    let logical = heap.cache().dblock(root).unwrap().blk.clone();
    let filtered_size = heap.cache().header().filter.unwrap().root.size;
    assert_eq!(
        heap.cache().disk_image(root).unwrap().len() as u64,
        filtered_size
    );
    assert!(filtered_size < 512, "repetitive payload should compress");

    let size = heap.cache().header().table.start_block_size;
    let cache = heap.cache_mut();
    cache.evict(root).unwrap();
    cache.load_dblock(root, Parent::Header, size).unwrap();
    assert_eq!(cache.dblock(root).unwrap().blk, logical);
    assert_eq!(cache.dblock(root).unwrap().file_size, filtered_size);
}

#[test]
fn corrupted_disk_image_fails_load_with_checksum_mismatch() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[5u8; 100]).unwrap();
    heap.cache_mut().flush_all().unwrap();
    let root = heap.cache().header().table.table_addr.unwrap();
    let size = heap.cache().header().table.start_block_size;

    let cache = heap.cache_mut();
    cache.evict(root).unwrap();
    // Flip a payload byte in the stored image
    let image = cache.disk_image_mut(root).unwrap();
    let last = image.len() - 1;
    image[last] ^= 0xFF;

    match cache.load_dblock(root, Parent::Header, size) {
        Err(HeapError::ChecksumMismatch { addr, stored, computed }) => {
            assert_eq!(addr, root);
            assert_ne!(stored, computed);
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert!(!cache.is_resident(root), "failed load left a partial entry");
}

#[test]
fn entry_status_reports_the_header_pinned() {
    let mut heap = FractalHeap::create(HeapParams::default()).unwrap();
    heap.insert(&[1u8; 16]).unwrap();
    let status = heap.cache().get_entry_status(heap.heap_addr());
    assert!(status.in_cache && status.dirty && status.pinned);
    assert!(status.flush_dep_parent);
    assert!(!status.flush_dep_child);
}
