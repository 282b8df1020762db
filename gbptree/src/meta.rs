//! Tree metadata pages.
//!
//! Page 0 holds the meta page describing the tree format. Pages 1 and 2 hold
//! the two tree state pages, written alternately by checkpoints. The newest
//! valid state page tells recovery which generations were in flight and how
//! far page ids have been allocated.
//!
//! # Meta page
//!
//! ```text
//! Offset  Size  Field
//! 0       8     magic "GBPTREE\0"
//! 8       4     format version
//! 12      4     page size
//! 16      4     data layer key size
//! 20      4     data layer value size
//! 24      4     root layer key size
//! 28      4     root layer value size
//! 32      4     CRC32 of bytes 0..32
//! ```
//!
//! # State page
//!
//! ```text
//! Offset  Size  Field
//! 0       8     stable generation
//! 8       8     unstable generation
//! 16      8     root id
//! 24      8     root generation
//! 32      8     last id
//! 40      1     clean flag
//! 41      4     CRC32 of bytes 0..41
//! ```

// Sizes are validated against u32 before encoding.
#![allow(clippy::cast_possible_truncation)]

use crate::generation::Generation;
use crate::node::{LayoutError, TreeNodeLayout};
use crate::page_cache::{
    CursorContext, CursorError, PageCursor, PageId, PagedFile, PagedFileLock, check_out_of_bounds,
    go_to,
};

/// Magic bytes identifying a tree file.
pub const MAGIC: [u8; 8] = *b"GBPTREE\0";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

pub const META_PAGE_ID: PageId = 0;
pub const STATE_PAGE_A: PageId = 1;
pub const STATE_PAGE_B: PageId = 2;

/// First page id that can hold a tree node.
pub const FIRST_TREE_NODE_ID: PageId = 3;

const META_TAG: &str = "treeMeta";

mod meta_offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const DATA_KEY_SIZE: usize = 16;
    pub const DATA_VALUE_SIZE: usize = 20;
    pub const ROOT_KEY_SIZE: usize = 24;
    pub const ROOT_VALUE_SIZE: usize = 28;
    pub const CHECKSUM: usize = 32;
    pub const LENGTH: usize = 36;
}

mod state_offsets {
    pub const STABLE_GENERATION: usize = 0;
    pub const UNSTABLE_GENERATION: usize = 8;
    pub const ROOT_ID: usize = 16;
    pub const ROOT_GENERATION: usize = 24;
    pub const LAST_ID: usize = 32;
    pub const CLEAN: usize = 40;
    pub const CHECKSUM: usize = 41;
    pub const LENGTH: usize = 45;
}

/// Format description of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub data_key_size: u32,
    pub data_value_size: u32,
    pub root_key_size: u32,
    pub root_value_size: u32,
}

impl Meta {
    pub fn write_to<C: PageCursor>(&self, cursor: &mut C) {
        let mut buf = [0u8; meta_offsets::LENGTH];
        buf[meta_offsets::MAGIC..meta_offsets::FORMAT_VERSION].copy_from_slice(&MAGIC);
        put_u32(&mut buf, meta_offsets::FORMAT_VERSION, FORMAT_VERSION);
        put_u32(&mut buf, meta_offsets::PAGE_SIZE, self.page_size);
        put_u32(&mut buf, meta_offsets::DATA_KEY_SIZE, self.data_key_size);
        put_u32(&mut buf, meta_offsets::DATA_VALUE_SIZE, self.data_value_size);
        put_u32(&mut buf, meta_offsets::ROOT_KEY_SIZE, self.root_key_size);
        put_u32(&mut buf, meta_offsets::ROOT_VALUE_SIZE, self.root_value_size);
        let checksum = crc32fast::hash(&buf[..meta_offsets::CHECKSUM]);
        put_u32(&mut buf, meta_offsets::CHECKSUM, checksum);

        cursor.set_offset(0);
        cursor.put_bytes(&buf);
    }

    /// Decode and validate the meta page under the cursor.
    pub fn read_from<C: PageCursor>(cursor: &mut C) -> Result<Self, MetaError> {
        let buf: [u8; meta_offsets::LENGTH] = read_consistent(cursor)?;

        if buf[meta_offsets::MAGIC..meta_offsets::FORMAT_VERSION] != MAGIC {
            return Err(MetaError::BadMagic);
        }
        let stored = get_u32(&buf, meta_offsets::CHECKSUM);
        let computed = crc32fast::hash(&buf[..meta_offsets::CHECKSUM]);
        if stored != computed {
            return Err(MetaError::ChecksumMismatch {
                page_id: META_PAGE_ID,
                stored,
                computed,
            });
        }
        let version = get_u32(&buf, meta_offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(MetaError::UnsupportedVersion(version));
        }

        Ok(Self {
            page_size: get_u32(&buf, meta_offsets::PAGE_SIZE),
            data_key_size: get_u32(&buf, meta_offsets::DATA_KEY_SIZE),
            data_value_size: get_u32(&buf, meta_offsets::DATA_VALUE_SIZE),
            root_key_size: get_u32(&buf, meta_offsets::ROOT_KEY_SIZE),
            root_value_size: get_u32(&buf, meta_offsets::ROOT_VALUE_SIZE),
        })
    }

    /// `(root_layout, data_layout)`.
    pub fn layouts(&self) -> Result<(TreeNodeLayout, TreeNodeLayout), LayoutError> {
        let page_size = self.page_size as usize;
        Ok((
            TreeNodeLayout::new(
                page_size,
                self.root_key_size as usize,
                self.root_value_size as usize,
            )?,
            TreeNodeLayout::new(
                page_size,
                self.data_key_size as usize,
                self.data_value_size as usize,
            )?,
        ))
    }
}

/// One of the two tree state pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePage {
    A,
    B,
}

impl StatePage {
    #[must_use]
    pub const fn page_id(self) -> PageId {
        match self {
            Self::A => STATE_PAGE_A,
            Self::B => STATE_PAGE_B,
        }
    }

    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Checkpointed tree state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub stable_generation: Generation,
    pub unstable_generation: Generation,
    pub root_id: PageId,
    pub root_generation: Generation,
    /// Highest page id ever allocated.
    pub last_id: PageId,
    /// Whether the tree was closed cleanly after this state was written.
    pub clean: bool,
}

impl TreeState {
    pub fn write_to<C: PageCursor>(&self, cursor: &mut C) {
        let mut buf = [0u8; state_offsets::LENGTH];
        put_u64(&mut buf, state_offsets::STABLE_GENERATION, self.stable_generation);
        put_u64(&mut buf, state_offsets::UNSTABLE_GENERATION, self.unstable_generation);
        put_u64(&mut buf, state_offsets::ROOT_ID, self.root_id);
        put_u64(&mut buf, state_offsets::ROOT_GENERATION, self.root_generation);
        put_u64(&mut buf, state_offsets::LAST_ID, self.last_id);
        buf[state_offsets::CLEAN] = u8::from(self.clean);
        let checksum = crc32fast::hash(&buf[..state_offsets::CHECKSUM]);
        put_u32(&mut buf, state_offsets::CHECKSUM, checksum);

        cursor.set_offset(0);
        cursor.put_bytes(&buf);
    }

    pub fn read_from<C: PageCursor>(cursor: &mut C) -> Result<StateSlot, CursorError> {
        let buf: [u8; state_offsets::LENGTH] = read_consistent(cursor)?;

        if buf.iter().all(|&b| b == 0) {
            return Ok(StateSlot::Empty);
        }
        let stored = get_u32(&buf, state_offsets::CHECKSUM);
        if stored != crc32fast::hash(&buf[..state_offsets::CHECKSUM])
            || buf[state_offsets::CLEAN] > 1
        {
            return Ok(StateSlot::Broken);
        }

        Ok(StateSlot::Valid(Self {
            stable_generation: get_u64(&buf, state_offsets::STABLE_GENERATION),
            unstable_generation: get_u64(&buf, state_offsets::UNSTABLE_GENERATION),
            root_id: get_u64(&buf, state_offsets::ROOT_ID),
            root_generation: get_u64(&buf, state_offsets::ROOT_GENERATION),
            last_id: get_u64(&buf, state_offsets::LAST_ID),
            clean: buf[state_offsets::CLEAN] == 1,
        }))
    }

    /// Whether `self` was written after `other`.
    #[must_use]
    pub const fn is_newer_than(&self, other: &Self) -> bool {
        self.unstable_generation > other.unstable_generation
            || (self.unstable_generation == other.unstable_generation
                && self.stable_generation > other.stable_generation)
    }
}

/// Decoded content of one state page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSlot {
    /// Never written.
    Empty,
    /// Checksum mismatch, e.g. a torn checkpoint write.
    Broken,
    Valid(TreeState),
}

/// Both state pages as read from the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePair {
    pub a: StateSlot,
    pub b: StateSlot,
}

impl StatePair {
    pub fn newest(&self) -> Result<(TreeState, StatePage), MetaError> {
        select_newest(self.a, self.b)
    }
}

/// Pick the newest valid state.
pub fn select_newest(a: StateSlot, b: StateSlot) -> Result<(TreeState, StatePage), MetaError> {
    match (a, b) {
        (StateSlot::Valid(state_a), StateSlot::Valid(state_b)) => {
            if state_a.is_newer_than(&state_b) {
                Ok((state_a, StatePage::A))
            } else if state_b.is_newer_than(&state_a) {
                Ok((state_b, StatePage::B))
            } else {
                Err(MetaError::AmbiguousState {
                    stable: state_a.stable_generation,
                    unstable: state_a.unstable_generation,
                })
            }
        }
        (StateSlot::Valid(state), _) => Ok((state, StatePage::A)),
        (_, StateSlot::Valid(state)) => Ok((state, StatePage::B)),
        _ => Err(MetaError::NoValidState { a, b }),
    }
}

pub fn read_meta<P: PagedFile>(paged_file: &P) -> Result<Meta, MetaError> {
    let context = CursorContext::new(META_TAG);
    let mut cursor = paged_file.io(META_PAGE_ID, PagedFileLock::SharedRead, &context)?;
    go_to(&mut cursor, "meta page", META_PAGE_ID)?;
    Meta::read_from(&mut cursor)
}

pub fn write_meta<P: PagedFile>(paged_file: &P, meta: &Meta) -> Result<(), MetaError> {
    let context = CursorContext::new(META_TAG);
    let mut cursor = paged_file.io(META_PAGE_ID, PagedFileLock::SharedWrite, &context)?;
    go_to(&mut cursor, "meta page", META_PAGE_ID)?;
    meta.write_to(&mut cursor);
    check_out_of_bounds(&mut cursor)?;
    Ok(())
}

pub fn read_state_pair<P: PagedFile>(paged_file: &P) -> Result<StatePair, MetaError> {
    let context = CursorContext::new(META_TAG);
    let mut cursor = paged_file.io(STATE_PAGE_A, PagedFileLock::SharedRead, &context)?;
    go_to(&mut cursor, "state page A", STATE_PAGE_A)?;
    let a = TreeState::read_from(&mut cursor)?;
    go_to(&mut cursor, "state page B", STATE_PAGE_B)?;
    let b = TreeState::read_from(&mut cursor)?;
    Ok(StatePair { a, b })
}

pub fn write_state<P: PagedFile>(
    paged_file: &P,
    page: StatePage,
    state: &TreeState,
) -> Result<(), MetaError> {
    let context = CursorContext::new(META_TAG);
    let mut cursor = paged_file.io(page.page_id(), PagedFileLock::SharedWrite, &context)?;
    go_to(&mut cursor, "state page", page.page_id())?;
    state.write_to(&mut cursor);
    check_out_of_bounds(&mut cursor)?;
    Ok(())
}

fn read_consistent<C: PageCursor, const N: usize>(cursor: &mut C) -> Result<[u8; N], CursorError> {
    let mut buf = [0u8; N];
    loop {
        cursor.set_offset(0);
        cursor.get_bytes(&mut buf);
        if !cursor.should_retry()? {
            break;
        }
    }
    check_out_of_bounds(cursor)?;
    Ok(buf)
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Errors that can occur when reading or writing tree metadata.
#[derive(Debug)]
pub enum MetaError {
    Cursor(CursorError),
    BadMagic,
    UnsupportedVersion(u32),
    ChecksumMismatch {
        page_id: PageId,
        stored: u32,
        computed: u32,
    },
    /// Meta page records a different page size than the file uses.
    PageSizeMismatch { meta: u32, file: usize },
    /// Both state pages carry the same generations.
    AmbiguousState {
        stable: Generation,
        unstable: Generation,
    },
    NoValidState { a: StateSlot, b: StateSlot },
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cursor(e) => write!(f, "cursor error: {e}"),
            Self::BadMagic => write!(f, "not a tree file: bad magic"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported format version {version}, expected {FORMAT_VERSION}")
            }
            Self::ChecksumMismatch {
                page_id,
                stored,
                computed,
            } => write!(
                f,
                "checksum mismatch on page {page_id}: stored {stored:#010x}, computed {computed:#010x}"
            ),
            Self::PageSizeMismatch { meta, file } => {
                write!(f, "meta page size {meta} does not match file page size {file}")
            }
            Self::AmbiguousState { stable, unstable } => write!(
                f,
                "both state pages have stableGeneration={stable}, unstableGeneration={unstable}"
            ),
            Self::NoValidState { a, b } => {
                write!(f, "no valid tree state: A={a:?}, B={b:?}")
            }
        }
    }
}

impl std::error::Error for MetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cursor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CursorError> for MetaError {
    fn from(e: CursorError) -> Self {
        Self::Cursor(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_cache::MemoryPagedFile;

    fn meta() -> Meta {
        Meta {
            page_size: 256,
            data_key_size: 8,
            data_value_size: 8,
            root_key_size: 16,
            root_value_size: 8,
        }
    }

    fn state(stable: Generation, unstable: Generation) -> TreeState {
        TreeState {
            stable_generation: stable,
            unstable_generation: unstable,
            root_id: 3,
            root_generation: stable,
            last_id: 10,
            clean: false,
        }
    }

    #[test]
    fn test_meta_roundtrip() {
        let file = MemoryPagedFile::with_page_count(256, 3).unwrap();
        write_meta(&file, &meta()).unwrap();
        assert_eq!(read_meta(&file).unwrap(), meta());

        let page = file.read_page(META_PAGE_ID).unwrap();
        assert_eq!(&page[..8], b"GBPTREE\0");

        let (root, data) = meta().layouts().unwrap();
        assert_eq!(root.key_size(), 16);
        assert_eq!(data.key_size(), 8);
    }

    #[test]
    fn test_meta_rejects_corruption() {
        let file = MemoryPagedFile::with_page_count(256, 3).unwrap();
        assert!(matches!(read_meta(&file), Err(MetaError::BadMagic)));

        write_meta(&file, &meta()).unwrap();
        let mut page = file.read_page(META_PAGE_ID).unwrap();
        page[meta_offsets::DATA_KEY_SIZE] ^= 0xFF;
        file.write_page(META_PAGE_ID, &page).unwrap();
        assert!(matches!(
            read_meta(&file),
            Err(MetaError::ChecksumMismatch { page_id: 0, .. })
        ));
    }

    #[test]
    fn test_state_slots() {
        let file = MemoryPagedFile::with_page_count(256, 3).unwrap();
        let pair = read_state_pair(&file).unwrap();
        assert_eq!(pair.a, StateSlot::Empty);
        assert_eq!(pair.b, StateSlot::Empty);
        assert!(matches!(pair.newest(), Err(MetaError::NoValidState { .. })));

        write_state(&file, StatePage::A, &state(4, 5)).unwrap();
        let pair = read_state_pair(&file).unwrap();
        assert_eq!(pair.a, StateSlot::Valid(state(4, 5)));
        assert_eq!(pair.newest().unwrap(), (state(4, 5), StatePage::A));

        // Torn write of state B
        write_state(&file, StatePage::B, &state(5, 6)).unwrap();
        let mut page = file.read_page(STATE_PAGE_B).unwrap();
        page[state_offsets::LAST_ID] ^= 0x01;
        file.write_page(STATE_PAGE_B, &page).unwrap();
        let pair = read_state_pair(&file).unwrap();
        assert_eq!(pair.b, StateSlot::Broken);
        assert_eq!(pair.newest().unwrap().1, StatePage::A);
    }

    #[test]
    fn test_select_newest() {
        let a = StateSlot::Valid(state(4, 5));
        let b = StateSlot::Valid(state(5, 6));
        assert_eq!(select_newest(a, b).unwrap(), (state(5, 6), StatePage::B));
        assert_eq!(select_newest(b, a).unwrap(), (state(5, 6), StatePage::A));

        // Same unstable generation: higher stable wins
        let c = StateSlot::Valid(state(3, 6));
        assert_eq!(select_newest(c, b).unwrap().1, StatePage::B);

        assert!(matches!(
            select_newest(b, b),
            Err(MetaError::AmbiguousState {
                stable: 5,
                unstable: 6
            })
        ));
        assert!(matches!(
            select_newest(StateSlot::Broken, StateSlot::Empty),
            Err(MetaError::NoValidState { .. })
        ));
    }

    #[test]
    fn test_state_page_other() {
        assert_eq!(StatePage::A.other(), StatePage::B);
        assert_eq!(StatePage::B.other().page_id(), STATE_PAGE_A);
    }
}
