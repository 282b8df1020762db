//! Crash generation cleaner.
//!
//! After an unclean shutdown, pointers written by a generation that never
//! reached a checkpoint may be scattered across the tree. Such a pointer
//! carries a generation strictly between the stable and unstable generation
//! and its target is assumed inconsistent. The cleaner scans every page in
//! `[low, high)` and overwrites each crashed GSP with the empty pointer.
//!
//! # Design
//!
//! - Worker tasks claim fixed-size batches of page ids from one shared atomic
//!   counter, so every page is visited by exactly one worker
//! - Each page is first scanned optimistically through a read cursor; the
//!   write cursor is only pinned when a crashed pointer was found
//! - The write pass rescans the page from scratch under exclusive access
//! - A failing worker raises a shared stop flag; the others finish their
//!   current batch and exit
//!
//! # Invariants
//!
//! - `unstable > stable` and `unstable - stable > 1`, checked before any I/O
//! - Only GSPs with `stable < generation < unstable` are ever written
//! - A page is pinned for write at most once per run

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::executor::{Executor, JobResult};
use crate::generation::{Generation, GenerationBracket, GenerationError};
use crate::monitor::Monitor;
use crate::node::{self, HEADER_POINTER_OFFSETS, Layer, NODE_TYPE_TREE_NODE, TreeNodeLayout};
use crate::page_cache::{
    CursorContext, CursorError, PageCursor, PageId, PagedFile, PagedFileLock, check_out_of_bounds,
    go_to,
};
use crate::pointer::{self, GSP_SIZE};

/// Cursor context tag used by cleanup workers.
pub const CLEANER_TAG: &str = "indexCleaner";

const MIN_BATCH_SIZE: u64 = 10;
const MAX_BATCH_SIZE: u64 = 100;
const BATCHES_PER_WORKER: u64 = 100;

/// Pages per claimed batch, aiming for about 100 batches per worker.
#[must_use]
pub fn batch_size(pages: u64, workers: usize) -> u64 {
    let workers = u64::try_from(workers.max(1)).unwrap_or(u64::MAX);
    let per_batch = pages / BATCHES_PER_WORKER.saturating_mul(workers);
    per_batch.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Counters of a completed cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub pages_to_clean: u64,
    pub tree_nodes_found: u64,
    pub pointers_cleaned: u64,
    pub elapsed: Duration,
}

/// Single-use cleaner for one tree.
pub struct CrashGenerationCleaner<P> {
    paged_file: Arc<P>,
    root_layout: TreeNodeLayout,
    data_layout: TreeNodeLayout,
    range: Range<PageId>,
    stable: Generation,
    unstable: Generation,
    monitor: Arc<dyn Monitor>,
    tree_name: String,
    workers: usize,
}

impl<P: PagedFile + 'static> CrashGenerationCleaner<P> {
    /// Create a cleaner over the page ids in `range`.
    ///
    /// Generations are validated when [`clean`](Self::clean) runs.
    pub fn new(
        paged_file: Arc<P>,
        root_layout: TreeNodeLayout,
        data_layout: TreeNodeLayout,
        range: Range<PageId>,
        stable: Generation,
        unstable: Generation,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self {
            paged_file,
            root_layout,
            data_layout,
            range,
            stable,
            unstable,
            monitor,
            tree_name: "gbptree".to_string(),
            workers: crate::config::CleanerConfig::default_workers(),
        }
    }

    #[must_use]
    pub fn with_tree_name(mut self, tree_name: impl Into<String>) -> Self {
        self.tree_name = tree_name.into();
        self
    }

    /// Number of worker tasks. Zero is treated as one.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Clean every crashed pointer in the range.
    ///
    /// # Pre-conditions
    /// - `unstable - stable > 1`; otherwise nothing is touched and the monitor
    ///   is not notified
    ///
    /// # Post-conditions
    /// - On success no GSP on a tree node in the range carries a crash
    ///   generation
    /// - On failure, repairs already applied remain in place
    #[allow(clippy::disallowed_methods)] // Arc::clone for worker tasks
    pub fn clean(self, executor: &dyn Executor) -> Result<CleanupSummary, CleanerError> {
        let bracket = GenerationBracket::for_crash_cleaning(self.stable, self.unstable)
            .map_err(CleanerError::UnexpectedGenerations)?;

        let started = Instant::now();
        self.monitor.cleanup_started();

        let pages_to_clean = self.range.end.saturating_sub(self.range.start);
        let batch_size = batch_size(pages_to_clean, self.workers);
        let progress = Arc::new(Progress::new(self.range.start));
        tracing::info!(
            tree = %self.tree_name,
            stable = bracket.stable(),
            unstable = bracket.unstable(),
            low = self.range.start,
            high = self.range.end,
            workers = self.workers,
            batch_size,
            "cleaning crash pointers"
        );

        let label = format!("Recovery clean up of '{}'", self.tree_name);
        let jobs: Vec<JobResult> = (0..self.workers)
            .map(|_| {
                let worker = Worker {
                    paged_file: Arc::clone(&self.paged_file),
                    progress: Arc::clone(&progress),
                    root_layout: self.root_layout,
                    data_layout: self.data_layout,
                    bracket,
                    high: self.range.end,
                    batch_size,
                };
                executor.submit(&label, Box::new(move || worker.run()))
            })
            .collect();

        let errors: Vec<CleanerError> = jobs
            .into_iter()
            .filter_map(|job| job.get().err())
            .collect();
        if !errors.is_empty() {
            tracing::warn!(
                tree = %self.tree_name,
                failed_workers = errors.len(),
                "crash generation cleanup failed"
            );
            return Err(CleanerError::Workers(errors));
        }

        let summary = CleanupSummary {
            pages_to_clean,
            tree_nodes_found: progress.tree_nodes.load(Ordering::Relaxed),
            pointers_cleaned: progress.pointers_cleaned.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        self.monitor.cleanup_finished(
            summary.pages_to_clean,
            summary.tree_nodes_found,
            summary.pointers_cleaned,
            u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
        );
        Ok(summary)
    }
}

/// State shared by all workers of one run.
struct Progress {
    next_id: AtomicU64,
    stop: AtomicBool,
    tree_nodes: AtomicU64,
    pointers_cleaned: AtomicU64,
}

impl Progress {
    const fn new(low: PageId) -> Self {
        Self {
            next_id: AtomicU64::new(low),
            stop: AtomicBool::new(false),
            tree_nodes: AtomicU64::new(0),
            pointers_cleaned: AtomicU64::new(0),
        }
    }
}

/// Raises the stop flag when dropped without being disarmed.
///
/// Covers both error returns and panics.
struct StopGuard<'a> {
    stop: &'a AtomicBool,
    armed: bool,
}

impl<'a> StopGuard<'a> {
    const fn new(stop: &'a AtomicBool) -> Self {
        Self { stop, armed: true }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stop.store(true, Ordering::Relaxed);
        }
    }
}

struct Worker<P> {
    paged_file: Arc<P>,
    progress: Arc<Progress>,
    root_layout: TreeNodeLayout,
    data_layout: TreeNodeLayout,
    bracket: GenerationBracket,
    high: PageId,
    batch_size: u64,
}

impl<P: PagedFile> Worker<P> {
    fn run(&self) -> Result<(), CleanerError> {
        let mut guard = StopGuard::new(&self.progress.stop);
        let context = CursorContext::new(CLEANER_TAG);
        let result = self.clean_batches(&context);
        if result.is_ok() {
            guard.disarm();
        }
        tracing::debug!(
            tag = context.tag(),
            pins = context.pins(),
            write_pins = context.write_pins(),
            retries = context.retries(),
            ok = result.is_ok(),
            "cleanup worker done"
        );
        result
    }

    fn clean_batches(&self, context: &CursorContext) -> Result<(), CleanerError> {
        let mut read_cursor = self.paged_file.io(0, PagedFileLock::SharedRead, context)?;
        let mut write_cursor = self.paged_file.io(0, PagedFileLock::SharedWrite, context)?;

        while !self.progress.stop.load(Ordering::Relaxed) {
            let from = self.progress.next_id.fetch_add(self.batch_size, Ordering::Relaxed);
            if from >= self.high {
                break;
            }
            let to = from.saturating_add(self.batch_size).min(self.high);

            let mut tree_nodes = 0;
            for page_id in from..to {
                if self.clean_page(&mut read_cursor, &mut write_cursor, page_id)? {
                    tree_nodes += 1;
                }
            }
            self.progress.tree_nodes.fetch_add(tree_nodes, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Returns whether `page_id` holds a tree node.
    fn clean_page<R: PageCursor, W: PageCursor>(
        &self,
        read_cursor: &mut R,
        write_cursor: &mut W,
        page_id: PageId,
    ) -> Result<bool, CleanerError> {
        go_to(read_cursor, "tree node", page_id)?;
        let node_type = read_consistent(read_cursor, node::node_type)?;
        if node_type != NODE_TYPE_TREE_NODE {
            return Ok(false);
        }

        if self.has_crashed_gspp(read_cursor)? {
            go_to(write_cursor, "tree node", page_id)?;
            self.clean_tree_node(write_cursor)?;
        }
        Ok(true)
    }

    fn layout_for(&self, layer_flag: u8) -> &TreeNodeLayout {
        match Layer::from_flag(layer_flag) {
            Layer::Data => &self.data_layout,
            Layer::Root => &self.root_layout,
        }
    }

    fn has_crashed_gspp<C: PageCursor>(&self, cursor: &mut C) -> Result<bool, CleanerError> {
        let (key_count, layer_flag) =
            read_consistent(cursor, |c| (node::key_count(c), node::layer_type(c)))?;
        let layout = *self.layout_for(layer_flag);

        read_consistent(cursor, |c| {
            if HEADER_POINTER_OFFSETS
                .iter()
                .any(|&offset| self.is_crashed_gspp(c, offset))
            {
                return true;
            }
            node::is_internal(c)
                && (0..=key_count as usize)
                    .take_while(|&pos| layout.reasonable_child_count(pos))
                    .any(|pos| self.is_crashed_gspp(c, layout.child_offset(pos)))
        })
    }

    fn is_crashed_gspp<C: PageCursor>(&self, cursor: &mut C, offset: usize) -> bool {
        self.is_crashed_gsp(cursor, offset) || self.is_crashed_gsp(cursor, offset + GSP_SIZE)
    }

    fn is_crashed_gsp<C: PageCursor>(&self, cursor: &mut C, offset: usize) -> bool {
        cursor.set_offset(offset);
        self.bracket.is_crashed(pointer::read_generation(cursor))
    }

    /// Zero every crashed GSP on the page under the write cursor.
    fn clean_tree_node<C: PageCursor>(&self, cursor: &mut C) -> Result<(), CleanerError> {
        let key_count = node::key_count(cursor);
        let layout = *self.layout_for(node::layer_type(cursor));

        let mut cleaned = 0;
        for offset in HEADER_POINTER_OFFSETS {
            cleaned += self.clean_crashed_gspp(cursor, offset);
        }
        if node::is_internal(cursor) {
            let positions = (0..=key_count as usize)
                .take_while(|&pos| layout.reasonable_child_count(pos));
            for pos in positions {
                cleaned += self.clean_crashed_gspp(cursor, layout.child_offset(pos));
            }
        }
        check_out_of_bounds(cursor)?;

        self.progress.pointers_cleaned.fetch_add(cleaned, Ordering::Relaxed);
        Ok(())
    }

    fn clean_crashed_gspp<C: PageCursor>(&self, cursor: &mut C, offset: usize) -> u64 {
        let mut cleaned = 0;
        for slot_offset in [offset, offset + GSP_SIZE] {
            if self.is_crashed_gsp(cursor, slot_offset) {
                cursor.set_offset(slot_offset);
                pointer::clean(cursor);
                cleaned += 1;
            }
        }
        cleaned
    }
}

/// Repeat `read` until it observes a consistent page, then check bounds.
fn read_consistent<C: PageCursor, T>(
    cursor: &mut C,
    mut read: impl FnMut(&mut C) -> T,
) -> Result<T, CleanerError> {
    let value = loop {
        let value = read(cursor);
        if !cursor.should_retry()? {
            break value;
        }
    };
    check_out_of_bounds(cursor)?;
    Ok(value)
}

/// Errors that can occur during crash generation cleanup.
#[derive(Debug)]
pub enum CleanerError {
    /// Generations do not leave room for a crash generation.
    UnexpectedGenerations(GenerationError),
    /// Cursor failure, including corruption detected after a read.
    Cursor(CursorError),
    /// A worker task panicked.
    WorkerPanicked(String),
    /// A worker thread could not be started.
    Spawn(std::io::Error),
    /// Every failure of a run, in worker submission order.
    Workers(Vec<CleanerError>),
}

impl std::fmt::Display for CleanerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedGenerations(e) => write!(f, "{e}"),
            Self::Cursor(e) => write!(f, "cursor error: {e}"),
            Self::WorkerPanicked(message) => write!(f, "cleanup worker panicked: {message}"),
            Self::Spawn(e) => write!(f, "failed to start cleanup worker: {e}"),
            Self::Workers(errors) => {
                write!(f, "{} cleanup worker(s) failed", errors.len())?;
                for e in errors {
                    write!(f, "; {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CleanerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnexpectedGenerations(e) => Some(e),
            Self::Cursor(e) => Some(e),
            Self::Spawn(e) => Some(e),
            Self::Workers(errors) => errors
                .first()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            Self::WorkerPanicked(_) => None,
        }
    }
}

impl From<CursorError> for CleanerError {
    fn from(e: CursorError) -> Self {
        Self::Cursor(e)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::executor::{InlineExecutor, ThreadExecutor};
    use crate::node::{BYTE_POS_LEFT_SIBLING, BYTE_POS_RIGHT_SIBLING, BYTE_POS_SUCCESSOR};
    use crate::page_cache::MemoryPagedFile;
    use crate::testing::{
        PAGE_SIZE, RecordingMonitor, init_node, layouts, new_file, put_gsp, read_gsp,
    };

    fn cleaner(
        file: &Arc<MemoryPagedFile>,
        range: Range<PageId>,
        stable: Generation,
        unstable: Generation,
        monitor: &Arc<RecordingMonitor>,
    ) -> CrashGenerationCleaner<MemoryPagedFile> {
        let (root_layout, data_layout) = layouts();
        let monitor: Arc<dyn Monitor> = Arc::clone(monitor) as Arc<dyn Monitor>;
        CrashGenerationCleaner::new(
            Arc::clone(file),
            root_layout,
            data_layout,
            range,
            stable,
            unstable,
            monitor,
        )
        .with_tree_name("test")
    }

    #[test]
    fn test_batch_size_is_clamped() {
        assert_eq!(batch_size(0, 4), 10);
        assert_eq!(batch_size(100, 4), 10);
        assert_eq!(batch_size(40_000, 2), 100);
        assert_eq!(batch_size(50_000, 8), 62);
        assert_eq!(batch_size(100_000_000, 1), 100);
        assert_eq!(batch_size(5_000, 0), 50);
    }

    #[test]
    fn test_cleans_crashed_successor_and_child() {
        let file = new_file(100);
        let monitor = Arc::new(RecordingMonitor::default());
        let (_, data_layout) = layouts();

        init_node(&file, 42, Layer::Data, false, 3);
        put_gsp(&file, 42, BYTE_POS_SUCCESSOR, 6, 77);
        put_gsp(&file, 42, data_layout.child_offset(0), 4, 50);
        put_gsp(&file, 42, data_layout.child_offset(1), 7, 51);
        put_gsp(&file, 42, data_layout.child_offset(2), 5, 52);
        let write_pins_before = file.write_pins(42);

        let summary = cleaner(&file, 0..100, 5, 8, &monitor)
            .with_workers(4)
            .clean(&ThreadExecutor)
            .unwrap();

        assert!(read_gsp(&file, 42, BYTE_POS_SUCCESSOR).is_empty());
        assert!(read_gsp(&file, 42, data_layout.child_offset(1)).is_empty());
        assert_eq!(read_gsp(&file, 42, data_layout.child_offset(0)).generation(), 4);
        assert_eq!(read_gsp(&file, 42, data_layout.child_offset(0)).pointer(), 50);
        assert_eq!(read_gsp(&file, 42, data_layout.child_offset(2)).generation(), 5);
        assert_eq!(summary.pointers_cleaned, 2);
        assert_eq!(summary.tree_nodes_found, 1);
        assert_eq!(summary.pages_to_clean, 100);

        assert_eq!(monitor.started(), 1);
        let finished = monitor.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            (
                finished[0].pages_to_clean,
                finished[0].tree_nodes_found,
                finished[0].pointers_cleaned
            ),
            (100, 1, 2)
        );
        assert_eq!(file.write_pins(42), write_pins_before + 1);
    }

    #[test]
    fn test_adjacent_generations_are_rejected_without_io() {
        let file = new_file(20);
        let monitor = Arc::new(RecordingMonitor::default());
        init_node(&file, 5, Layer::Data, true, 0);
        let pins_before = file.total_pins();

        let err = cleaner(&file, 0..20, 5, 6, &monitor)
            .clean(&ThreadExecutor)
            .unwrap_err();

        assert!(matches!(
            err,
            CleanerError::UnexpectedGenerations(GenerationError::NoCrashGeneration {
                stable: 5,
                unstable: 6
            })
        ));
        assert_eq!(file.total_pins(), pins_before);
        assert_eq!(monitor.started(), 0);
        assert!(monitor.finished().is_empty());

        let err = cleaner(&file, 0..20, 8, 5, &monitor)
            .clean(&ThreadExecutor)
            .unwrap_err();
        assert!(err.to_string().contains("unexpected generations"));
        assert_eq!(file.total_pins(), pins_before);
    }

    #[test]
    fn test_worker_failure_stops_other_batches() {
        let file = new_file(103);
        let monitor = Arc::new(RecordingMonitor::default());
        for page_id in [10, 24, 50] {
            init_node(&file, page_id, Layer::Data, true, 0);
            put_gsp(&file, page_id, BYTE_POS_RIGHT_SIBLING, 6, 1);
        }
        assert!(file.inject_out_of_bounds(25));

        // 100 pages over 4 workers: batches of 10 starting at 3
        let err = cleaner(&file, 3..103, 5, 8, &monitor)
            .with_workers(4)
            .clean(&InlineExecutor)
            .unwrap_err();

        match &err {
            CleanerError::Workers(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    errors[0],
                    CleanerError::Cursor(CursorError::OutOfBounds { page_id: Some(25) })
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("pageId:25"));

        // Repairs made before the failure stay in place
        assert!(read_gsp(&file, 10, BYTE_POS_RIGHT_SIBLING).is_empty());
        assert!(read_gsp(&file, 24, BYTE_POS_RIGHT_SIBLING).is_empty());
        // Nothing past the failing batch was claimed
        assert_eq!(read_gsp(&file, 50, BYTE_POS_RIGHT_SIBLING).generation(), 6);
        assert!(monitor.finished().is_empty());
    }

    #[test]
    fn test_second_run_finds_nothing() {
        let file = new_file(64);
        let monitor = Arc::new(RecordingMonitor::default());
        init_node(&file, 7, Layer::Data, true, 0);
        put_gsp(&file, 7, BYTE_POS_LEFT_SIBLING, 7, 3);
        put_gsp(&file, 7, BYTE_POS_LEFT_SIBLING + GSP_SIZE, 6, 4);
        let write_pins_before = file.write_pins(7);

        let first = cleaner(&file, 3..64, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(first.pointers_cleaned, 2);

        let second = cleaner(&file, 3..64, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(second.pointers_cleaned, 0);
        assert_eq!(second.tree_nodes_found, 1);
        assert_eq!(file.write_pins(7), write_pins_before + 1);
    }

    #[test]
    fn test_root_layer_uses_root_layout() {
        let file = new_file(16);
        let monitor = Arc::new(RecordingMonitor::default());
        let (root_layout, data_layout) = layouts();
        assert_ne!(root_layout.child_offset(1), data_layout.child_offset(1));

        init_node(&file, 4, Layer::Root, false, 1);
        put_gsp(&file, 4, root_layout.child_offset(1), 6, 9);

        let summary = cleaner(&file, 3..16, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(summary.pointers_cleaned, 1);
        assert!(read_gsp(&file, 4, root_layout.child_offset(1)).is_empty());
    }

    #[test]
    fn test_corrupt_key_count_is_bounded() {
        let file = new_file(16);
        let monitor = Arc::new(RecordingMonitor::default());
        let (_, data_layout) = layouts();

        init_node(&file, 4, Layer::Data, false, u32::MAX);
        let last = data_layout.internal_max_key_count();
        put_gsp(&file, 4, data_layout.child_offset(last), 7, 9);

        let summary = cleaner(&file, 3..16, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(summary.pointers_cleaned, 1);
        assert!(data_layout.child_offset(last) + 2 * GSP_SIZE <= PAGE_SIZE);
    }

    #[test]
    fn test_leaf_children_are_not_scanned() {
        let file = new_file(16);
        let monitor = Arc::new(RecordingMonitor::default());
        let (_, data_layout) = layouts();

        // Leaf bytes in the child area are values, not pointers
        init_node(&file, 4, Layer::Data, true, 2);
        put_gsp(&file, 4, data_layout.child_offset(0), 6, 9);
        let write_pins_before = file.write_pins(4);

        let summary = cleaner(&file, 3..16, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(summary.pointers_cleaned, 0);
        assert_eq!(read_gsp(&file, 4, data_layout.child_offset(0)).generation(), 6);
        assert_eq!(file.write_pins(4), write_pins_before);
    }

    #[test]
    fn test_free_list_pages_are_skipped() {
        let file = new_file(16);
        let monitor = Arc::new(RecordingMonitor::default());
        init_node(&file, 4, Layer::Data, true, 0);
        put_gsp(&file, 4, BYTE_POS_SUCCESSOR, 6, 9);
        let mut page = file.read_page(4).unwrap();
        page[0] = node::NODE_TYPE_FREE_LIST_NODE;
        file.write_page(4, &page).unwrap();

        let summary = cleaner(&file, 3..16, 5, 8, &monitor)
            .clean(&ThreadExecutor)
            .unwrap();
        assert_eq!(summary.tree_nodes_found, 0);
        assert_eq!(read_gsp(&file, 4, BYTE_POS_SUCCESSOR).generation(), 6);
    }

    #[test]
    fn test_random_trees_are_cleaned_completely_and_safely() {
        let mut rng = StdRng::seed_from_u64(0x6b70_7472);
        let (root_layout, data_layout) = layouts();

        for round in 0..8 {
            let page_count = rng.random_range(20..400u64);
            let file = new_file(page_count);
            let monitor = Arc::new(RecordingMonitor::default());
            let stable = rng.random_range(1..20u64);
            let unstable = stable + rng.random_range(2..6u64);

            let mut slots: HashMap<(PageId, usize), Generation> = HashMap::new();
            for page_id in 3..page_count {
                if rng.random_bool(0.3) {
                    continue;
                }
                let layer = if rng.random_bool(0.2) { Layer::Root } else { Layer::Data };
                let layout = if layer == Layer::Root { root_layout } else { data_layout };
                let leaf = rng.random_bool(0.5);
                let max_keys = u32::try_from(layout.internal_max_key_count()).unwrap();
                let key_count = rng.random_range(0..=max_keys);
                init_node(&file, page_id, layer, leaf, key_count);

                let mut offsets = HEADER_POINTER_OFFSETS.to_vec();
                if !leaf {
                    offsets.extend((0..=key_count as usize).map(|pos| layout.child_offset(pos)));
                }
                for offset in offsets {
                    for slot_offset in [offset, offset + GSP_SIZE] {
                        if rng.random_bool(0.5) {
                            let generation = rng.random_range(1..=unstable);
                            put_gsp(&file, page_id, slot_offset, generation, page_id);
                            slots.insert((page_id, slot_offset), generation);
                        }
                    }
                }
            }

            let crashed = slots
                .values()
                .filter(|&&generation| generation > stable && generation < unstable)
                .count() as u64;
            let write_pins_before: Vec<u64> =
                (0..page_count).map(|page_id| file.write_pins(page_id)).collect();
            let workers = rng.random_range(1..6usize);
            let summary = cleaner(&file, 3..page_count, stable, unstable, &monitor)
                .with_workers(workers)
                .clean(&ThreadExecutor)
                .unwrap();
            assert_eq!(summary.pointers_cleaned, crashed, "round {round}");

            for (&(page_id, offset), &generation) in &slots {
                let gsp = read_gsp(&file, page_id, offset);
                if generation > stable && generation < unstable {
                    assert!(gsp.is_empty(), "round {round} page {page_id} offset {offset}");
                } else {
                    assert_eq!(gsp.generation(), generation);
                    assert_eq!(gsp.pointer(), page_id);
                    assert!(gsp.is_checksum_valid());
                }
            }
            for (page_id, before) in (0..page_count).zip(write_pins_before) {
                assert!(
                    file.write_pins(page_id) - before <= 1,
                    "page {page_id} pinned for write twice"
                );
            }
        }
    }
}
