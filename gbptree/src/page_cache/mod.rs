//! Paged file and optimistic page cursor contract.
//!
//! The tree never touches bytes directly. It goes through cursors handed out
//! by a [`PagedFile`]:
//!
//! - A **shared read** cursor reads optimistically. Readers take no lock, so
//!   every group of reads is wrapped in a retry loop:
//!
//!   ```ignore
//!   let key_count = loop {
//!       let key_count = node::key_count(&mut cursor);
//!       if !cursor.should_retry()? {
//!           break key_count;
//!       }
//!   };
//!   check_out_of_bounds(&mut cursor)?;
//!   ```
//!
//! - A **shared write** cursor holds the page exclusively while pinned, so its
//!   reads are always consistent and no retry loop is needed.
//!
//! Accesses outside the page never panic. They raise the cursor's bounds flag,
//! which callers check once the retry loop has settled.

mod memory;

use std::sync::atomic::{AtomicU64, Ordering};

pub use memory::{MemoryCursor, MemoryPagedFile};

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Lock mode requested when opening a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagedFileLock {
    /// Optimistic reads, validated with [`PageCursor::should_retry`].
    SharedRead,
    /// Exclusive access to the pinned page.
    SharedWrite,
}

/// A file of fixed-size pages that hands out cursors.
pub trait PagedFile: Send + Sync {
    type Cursor<'a>: PageCursor
    where
        Self: 'a;

    /// Open a cursor. No page is pinned until [`PageCursor::next`] is called.
    fn io<'a>(
        &'a self,
        page_id: PageId,
        lock: PagedFileLock,
        context: &'a CursorContext,
    ) -> Result<Self::Cursor<'a>, CursorError>;

    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Number of pages currently in the file.
    fn page_count(&self) -> u64;
}

/// Positioned access to one pinned page at a time.
///
/// All multi-byte values are little-endian. `get_*`/`put_*` operate at the
/// current offset and advance it.
pub trait PageCursor {
    /// Pin `page_id`, unpinning whatever was pinned before.
    ///
    /// Returns `false` if the page lies beyond the end of the file.
    fn next(&mut self, page_id: PageId) -> Result<bool, CursorError>;

    /// The pinned page, if any.
    fn current_page_id(&self) -> Option<PageId>;

    fn offset(&self) -> usize;

    fn set_offset(&mut self, offset: usize);

    /// Copy bytes from the current offset into `dst`.
    fn get_bytes(&mut self, dst: &mut [u8]);

    /// Copy `src` into the page at the current offset.
    fn put_bytes(&mut self, src: &[u8]);

    /// Whether the reads since the page was pinned (or since the last retry)
    /// may have raced a writer and must be repeated.
    ///
    /// Write cursors hold the page exclusively and always return `false`.
    fn should_retry(&mut self) -> Result<bool, CursorError>;

    /// Return and clear the flag raised by an out-of-page access.
    fn check_and_clear_bounds_flag(&mut self) -> bool;

    fn get_u8(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf);
        buf[0]
    }

    fn get_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.get_bytes(&mut buf);
        u16::from_le_bytes(buf)
    }

    fn get_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    /// Read a 6 byte unsigned value.
    fn get_u48(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf[..6]);
        u64::from_le_bytes(buf)
    }

    fn get_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    /// Write the low 6 bytes of `value`.
    fn put_u48(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes()[..6]);
    }

    fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    fn get_u8_at(&mut self, offset: usize) -> u8 {
        self.set_offset(offset);
        self.get_u8()
    }

    fn get_u32_at(&mut self, offset: usize) -> u32 {
        self.set_offset(offset);
        self.get_u32()
    }

    fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.set_offset(offset);
        self.put_u8(value);
    }

    fn put_u32_at(&mut self, offset: usize, value: u32) {
        self.set_offset(offset);
        self.put_u32(value);
    }
}

/// Per-task tracing context shared by the cursors a task opens.
#[derive(Debug)]
pub struct CursorContext {
    tag: &'static str,
    pins: AtomicU64,
    write_pins: AtomicU64,
    retries: AtomicU64,
}

impl CursorContext {
    #[must_use]
    pub const fn new(tag: &'static str) -> Self {
        Self {
            tag,
            pins: AtomicU64::new(0),
            write_pins: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn tag(&self) -> &'static str {
        self.tag
    }

    pub(crate) fn record_pin(&self, lock: PagedFileLock) {
        self.pins.fetch_add(1, Ordering::Relaxed);
        if lock == PagedFileLock::SharedWrite {
            self.write_pins.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Pages pinned through this context, by any cursor.
    #[must_use]
    pub fn pins(&self) -> u64 {
        self.pins.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_pins(&self) -> u64 {
        self.write_pins.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Pin `page_id` or fail.
pub fn go_to<C: PageCursor>(
    cursor: &mut C,
    description: &'static str,
    page_id: PageId,
) -> Result<(), CursorError> {
    if cursor.next(page_id)? {
        Ok(())
    } else {
        Err(CursorError::PageNotFound {
            description,
            page_id,
        })
    }
}

/// Fail if the reads of a settled retry loop went outside the page.
pub fn check_out_of_bounds<C: PageCursor>(cursor: &mut C) -> Result<(), CursorError> {
    if cursor.check_and_clear_bounds_flag() {
        return Err(CursorError::OutOfBounds {
            page_id: cursor.current_page_id(),
        });
    }
    Ok(())
}

/// Errors reported by paged files and cursors.
#[derive(Debug)]
pub enum CursorError {
    /// I/O error while loading or flushing a file.
    Io(std::io::Error),
    /// A page required by an operation does not exist.
    PageNotFound {
        description: &'static str,
        page_id: PageId,
    },
    /// An access went outside the pinned page, or the page is corrupt.
    OutOfBounds { page_id: Option<PageId> },
    /// File length is not a whole number of pages.
    PartialPage { file_len: u64, page_size: usize },
    /// Page size rejected (zero, or a buffer of the wrong length).
    InvalidPageSize(usize),
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageNotFound {
                description,
                page_id,
            } => write!(f, "could not go to page {page_id} ({description})"),
            Self::OutOfBounds { page_id: Some(page_id) } => {
                write!(f, "some internal problem causing out of bounds: pageId:{page_id}")
            }
            Self::OutOfBounds { page_id: None } => {
                write!(f, "some internal problem causing out of bounds on an unpinned cursor")
            }
            Self::PartialPage {
                file_len,
                page_size,
            } => write!(
                f,
                "file length {file_len} is not a multiple of page size {page_size}"
            ),
            Self::InvalidPageSize(size) => write!(f, "invalid page size: {size}"),
        }
    }
}

impl std::error::Error for CursorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CursorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
