//! Test fixtures: small paged files, node builders and a recording monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::generation::Generation;
use crate::monitor::Monitor;
use crate::node::{self, Layer, TreeNodeLayout};
use crate::page_cache::{
    CursorContext, MemoryPagedFile, PageCursor, PageId, PagedFile, PagedFileLock, go_to,
};
use crate::pointer::GenerationSafePointer;

pub const PAGE_SIZE: usize = 256;
pub const DATA_KEY_SIZE: usize = 8;
pub const DATA_VALUE_SIZE: usize = 8;
pub const ROOT_KEY_SIZE: usize = 16;
pub const ROOT_VALUE_SIZE: usize = 8;

/// `(root_layout, data_layout)` for [`PAGE_SIZE`].
pub fn layouts() -> (TreeNodeLayout, TreeNodeLayout) {
    (
        TreeNodeLayout::new(PAGE_SIZE, ROOT_KEY_SIZE, ROOT_VALUE_SIZE).unwrap(),
        TreeNodeLayout::new(PAGE_SIZE, DATA_KEY_SIZE, DATA_VALUE_SIZE).unwrap(),
    )
}

pub fn new_file(page_count: u64) -> Arc<MemoryPagedFile> {
    Arc::new(MemoryPagedFile::with_page_count(PAGE_SIZE, page_count).unwrap())
}

/// Run `f` with a write cursor pinned on `page_id`.
pub fn with_page<R>(
    file: &MemoryPagedFile,
    page_id: PageId,
    f: impl FnOnce(&mut crate::page_cache::MemoryCursor<'_>) -> R,
) -> R {
    let context = CursorContext::new("fixture");
    let mut cursor = file
        .io(page_id, PagedFileLock::SharedWrite, &context)
        .unwrap();
    go_to(&mut cursor, "fixture", page_id).unwrap();
    f(&mut cursor)
}

/// Write an empty tree node header with the given key count.
pub fn init_node(
    file: &MemoryPagedFile,
    page_id: PageId,
    layer: Layer,
    leaf: bool,
    key_count: u32,
) {
    with_page(file, page_id, |cursor| {
        node::initialize_node(cursor, layer, leaf, 1).unwrap();
        node::set_key_count(cursor, key_count);
    });
}

/// Write one raw GSP at `offset`, bypassing pair slot selection.
pub fn put_gsp(
    file: &MemoryPagedFile,
    page_id: PageId,
    offset: usize,
    generation: Generation,
    pointer: u64,
) {
    with_page(file, page_id, |cursor| {
        cursor.set_offset(offset);
        GenerationSafePointer::new(generation, pointer)
            .unwrap()
            .write_to(cursor);
    });
}

/// Read one raw GSP through a read cursor. Takes no write pin.
pub fn read_gsp(file: &MemoryPagedFile, page_id: PageId, offset: usize) -> GenerationSafePointer {
    let context = CursorContext::new("fixture");
    let mut cursor = file
        .io(page_id, PagedFileLock::SharedRead, &context)
        .unwrap();
    go_to(&mut cursor, "fixture", page_id).unwrap();
    loop {
        cursor.set_offset(offset);
        let gsp = GenerationSafePointer::read_from(&mut cursor);
        if !cursor.should_retry().unwrap() {
            return gsp;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedEvent {
    pub pages_to_clean: u64,
    pub tree_nodes_found: u64,
    pub pointers_cleaned: u64,
    pub elapsed_ms: u64,
}

/// Monitor that records every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    started: AtomicU64,
    finished: Mutex<Vec<FinishedEvent>>,
}

impl RecordingMonitor {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> Vec<FinishedEvent> {
        self.finished.lock().unwrap().clone()
    }
}

impl Monitor for RecordingMonitor {
    fn cleanup_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn cleanup_finished(
        &self,
        pages_to_clean: u64,
        tree_nodes_found: u64,
        pointers_cleaned: u64,
        elapsed_ms: u64,
    ) {
        self.finished.lock().unwrap().push(FinishedEvent {
            pages_to_clean,
            tree_nodes_found,
            pointers_cleaned,
            elapsed_ms,
        });
    }
}
