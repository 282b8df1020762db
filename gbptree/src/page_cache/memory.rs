//! In-memory paged file with a seqlock per page.
//!
//! # Design
//!
//! Every page frame carries a sequence word and a write latch:
//!
//! - A write cursor takes the latch, bumps the sequence to an odd value and
//!   keeps it odd while the page stays pinned. Unpinning bumps it back to even.
//! - A read cursor records the sequence when it pins the page and reads without
//!   any lock. `should_retry` re-checks the sequence. A changed or odd stamp
//!   means a writer raced the reads, so the cursor waits for the writer to
//!   finish and asks the caller to read again.
//!
//! Page bytes are atomics accessed with relaxed ordering. The acquire/release
//! fences around them give the seqlock its happens-before edges without any
//! unsafe code.
//!
//! # Invariants
//!
//! - At most one write cursor has a given page pinned at any time
//! - The sequence of a page is odd iff a write cursor has it pinned
//! - A thread must not re-read, through a read cursor, a page its own write
//!   cursor still holds (the read would wait for itself)

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering, fence};

use super::{CursorContext, CursorError, PageCursor, PageId, PagedFile, PagedFileLock};

/// Tag used for the convenience whole-page accessors.
const WHOLE_PAGE_TAG: &str = "memoryPagedFile";

struct PageFrame {
    /// Seqlock word. Odd while a writer holds the page.
    sequence: AtomicU64,
    /// Exclusive write latch.
    latch: AtomicBool,
    /// Injected fault: read pins report out of bounds.
    faulty: AtomicBool,
    write_pins: AtomicU64,
    bytes: Box<[AtomicU8]>,
}

impl PageFrame {
    fn zeroed(page_size: usize) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            latch: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            write_pins: AtomicU64::new(0),
            bytes: (0..page_size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            latch: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            write_pins: AtomicU64::new(0),
            bytes: bytes.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    /// Wait until no writer holds the page and return the even stamp.
    fn stable_stamp(&self) -> u64 {
        loop {
            let stamp = self.sequence.load(Ordering::Acquire);
            if stamp % 2 == 0 {
                return stamp;
            }
            std::thread::yield_now();
        }
    }

    fn lock_exclusive(&self) {
        while self
            .latch
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.write_pins.fetch_add(1, Ordering::Relaxed);
    }

    fn unlock_exclusive(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
        self.latch.store(false, Ordering::Release);
    }
}

/// A paged file held entirely in memory.
///
/// Can be loaded from and flushed back to a file on disk.
pub struct MemoryPagedFile {
    page_size: usize,
    frames: Box<[PageFrame]>,
    /// Pins by any cursor, for observing I/O.
    pins: AtomicU64,
}

impl MemoryPagedFile {
    /// Create a file of `page_count` zeroed pages.
    pub fn with_page_count(page_size: usize, page_count: u64) -> Result<Self, CursorError> {
        if page_size == 0 {
            return Err(CursorError::InvalidPageSize(page_size));
        }
        let frames = (0..page_count).map(|_| PageFrame::zeroed(page_size)).collect();
        Ok(Self {
            page_size,
            frames,
            pins: AtomicU64::new(0),
        })
    }

    /// Load an existing file. Its length must be a whole number of pages.
    pub fn open(path: &Path, page_size: usize) -> Result<Self, CursorError> {
        if page_size == 0 {
            return Err(CursorError::InvalidPageSize(page_size));
        }
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len % page_size as u64 != 0 {
            return Err(CursorError::PartialPage {
                file_len,
                page_size,
            });
        }

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let frames = contents
            .chunks_exact(page_size)
            .map(PageFrame::from_bytes)
            .collect();

        Ok(Self {
            page_size,
            frames,
            pins: AtomicU64::new(0),
        })
    }

    /// Write every page in place at its offset in `path`, then sync.
    ///
    /// The file is never truncated. A failure part way through leaves the
    /// pages not yet written as they were on disk, and bytes past the last
    /// page are kept.
    #[allow(clippy::suspicious_open_options)] // no truncation on purpose
    pub fn flush(&self, path: &Path) -> Result<(), CursorError> {
        let mut file = OpenOptions::new().write(true).create(true).open(path)?;
        for page_id in 0..self.page_count() {
            let page = self.read_page(page_id)?;
            file.seek(SeekFrom::Start(page_id * self.page_size as u64))?;
            file.write_all(&page)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Consistent copy of a whole page.
    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>, CursorError> {
        let context = CursorContext::new(WHOLE_PAGE_TAG);
        let mut cursor = self.io(page_id, PagedFileLock::SharedRead, &context)?;
        super::go_to(&mut cursor, "read page", page_id)?;

        let mut page = vec![0u8; self.page_size];
        loop {
            cursor.set_offset(0);
            cursor.get_bytes(&mut page);
            if !cursor.should_retry()? {
                break;
            }
        }
        super::check_out_of_bounds(&mut cursor)?;
        Ok(page)
    }

    /// Replace a whole page.
    pub fn write_page(&self, page_id: PageId, bytes: &[u8]) -> Result<(), CursorError> {
        if bytes.len() != self.page_size {
            return Err(CursorError::InvalidPageSize(bytes.len()));
        }
        let context = CursorContext::new(WHOLE_PAGE_TAG);
        let mut cursor = self.io(page_id, PagedFileLock::SharedWrite, &context)?;
        super::go_to(&mut cursor, "write page", page_id)?;
        cursor.put_bytes(bytes);
        Ok(())
    }

    /// Make every future read pin of `page_id` report out of bounds.
    ///
    /// Returns `false` if the page does not exist.
    pub fn inject_out_of_bounds(&self, page_id: PageId) -> bool {
        match self.frame(page_id) {
            Some(frame) => {
                frame.faulty.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Pins made by any cursor since the file was created.
    #[must_use]
    pub fn total_pins(&self) -> u64 {
        self.pins.load(Ordering::Relaxed)
    }

    /// Write pins taken on `page_id` since the file was created.
    #[must_use]
    pub fn write_pins(&self, page_id: PageId) -> u64 {
        self.frame(page_id)
            .map_or(0, |frame| frame.write_pins.load(Ordering::Relaxed))
    }

    fn frame(&self, page_id: PageId) -> Option<&PageFrame> {
        usize::try_from(page_id)
            .ok()
            .and_then(|index| self.frames.get(index))
    }
}

impl PagedFile for MemoryPagedFile {
    type Cursor<'a> = MemoryCursor<'a>;

    fn io<'a>(
        &'a self,
        page_id: PageId,
        lock: PagedFileLock,
        context: &'a CursorContext,
    ) -> Result<MemoryCursor<'a>, CursorError> {
        Ok(MemoryCursor {
            file: self,
            context,
            lock,
            initial_page_id: page_id,
            page_id: None,
            stamp: 0,
            offset: 0,
            out_of_bounds: false,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.frames.len() as u64
    }
}

/// Cursor over a [`MemoryPagedFile`].
pub struct MemoryCursor<'a> {
    file: &'a MemoryPagedFile,
    context: &'a CursorContext,
    lock: PagedFileLock,
    initial_page_id: PageId,
    page_id: Option<PageId>,
    /// Sequence observed at pin (read cursors only).
    stamp: u64,
    offset: usize,
    out_of_bounds: bool,
}

impl<'a> MemoryCursor<'a> {
    /// The page id the cursor was opened at.
    #[must_use]
    pub const fn initial_page_id(&self) -> PageId {
        self.initial_page_id
    }

    #[must_use]
    pub const fn lock(&self) -> PagedFileLock {
        self.lock
    }

    fn frame(&self) -> Option<&'a PageFrame> {
        let file = self.file;
        self.page_id.and_then(|page_id| file.frame(page_id))
    }

    /// Range of the next `len` bytes, or `None` if it leaves the page.
    fn span(&self, frame: &PageFrame, len: usize) -> Option<std::ops::Range<usize>> {
        let end = self.offset.checked_add(len)?;
        (end <= frame.bytes.len()).then_some(self.offset..end)
    }

    fn unpin(&mut self) {
        if self.lock == PagedFileLock::SharedWrite {
            if let Some(frame) = self.frame() {
                frame.unlock_exclusive();
            }
        }
        self.page_id = None;
    }
}

impl PageCursor for MemoryCursor<'_> {
    fn next(&mut self, page_id: PageId) -> Result<bool, CursorError> {
        self.unpin();
        let Some(frame) = self.file.frame(page_id) else {
            return Ok(false);
        };

        match self.lock {
            PagedFileLock::SharedRead => {
                self.stamp = frame.sequence.load(Ordering::Acquire);
                self.out_of_bounds = frame.faulty.load(Ordering::Relaxed);
            }
            PagedFileLock::SharedWrite => {
                frame.lock_exclusive();
                self.out_of_bounds = false;
            }
        }
        self.file.pins.fetch_add(1, Ordering::Relaxed);
        self.context.record_pin(self.lock);
        self.page_id = Some(page_id);
        self.offset = 0;
        Ok(true)
    }

    fn current_page_id(&self) -> Option<PageId> {
        self.page_id
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn get_bytes(&mut self, dst: &mut [u8]) {
        let span = self
            .frame()
            .and_then(|frame| self.span(frame, dst.len()).map(|span| (frame, span)));
        match span {
            Some((frame, span)) => {
                for (byte, cell) in dst.iter_mut().zip(&frame.bytes[span.clone()]) {
                    *byte = cell.load(Ordering::Relaxed);
                }
                self.offset = span.end;
            }
            None => {
                dst.fill(0);
                self.out_of_bounds = true;
            }
        }
    }

    fn put_bytes(&mut self, src: &[u8]) {
        if self.lock != PagedFileLock::SharedWrite {
            // Writing through a read cursor is a programming error surfaced
            // the same way as corruption.
            self.out_of_bounds = true;
            return;
        }
        let span = self
            .frame()
            .and_then(|frame| self.span(frame, src.len()).map(|span| (frame, span)));
        match span {
            Some((frame, span)) => {
                for (cell, &byte) in frame.bytes[span.clone()].iter().zip(src) {
                    cell.store(byte, Ordering::Relaxed);
                }
                self.offset = span.end;
            }
            None => self.out_of_bounds = true,
        }
    }

    fn should_retry(&mut self) -> Result<bool, CursorError> {
        if self.lock == PagedFileLock::SharedWrite {
            return Ok(false);
        }
        let Some(frame) = self.frame() else {
            return Ok(false);
        };

        fence(Ordering::Acquire);
        let current = frame.sequence.load(Ordering::Relaxed);
        if current == self.stamp && current % 2 == 0 {
            return Ok(false);
        }

        self.context.record_retry();
        self.stamp = frame.stable_stamp();
        self.offset = 0;
        self.out_of_bounds = frame.faulty.load(Ordering::Relaxed);
        Ok(true)
    }

    fn check_and_clear_bounds_flag(&mut self) -> bool {
        std::mem::take(&mut self.out_of_bounds)
    }
}

impl Drop for MemoryCursor<'_> {
    fn drop(&mut self) {
        self.unpin();
    }
}
