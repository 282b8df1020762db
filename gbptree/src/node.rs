//! Tree node page layout.
//!
//! # Header Format
//!
//! ```text
//! Offset  Size  Field
//! 0       1     node type (1 = tree node, 2 = free-list node)
//! 1       1     layer type (0 = root layer, 1 = data layer)
//! 2       1     leaf flag (1 = leaf, 0 = internal)
//! 3       4     node generation
//! 7       4     key count
//! 11      24    right sibling GSPP
//! 35      24    left sibling GSPP
//! 59      24    successor GSPP
//! 83            end of header
//! ```
//!
//! Internal nodes store their keys right after the header, followed by
//! `internal_max_key_count + 1` child GSPPs. The child area position depends
//! on the key size, so the data layer and the root layer each get their own
//! [`TreeNodeLayout`].

// Generations are validated against MAX_GENERATION (u32) before encoding.
#![allow(clippy::cast_possible_truncation)]

use crate::generation::{Generation, GenerationBracket, MAX_GENERATION, MIN_GENERATION};
use crate::page_cache::PageCursor;
use crate::pointer::{GSPP_SIZE, GenerationSafePointerPair, PointerError, Slot};

pub const BYTE_POS_NODE_TYPE: usize = 0;
pub const BYTE_POS_LAYER_TYPE: usize = 1;
pub const BYTE_POS_TYPE: usize = 2;
pub const BYTE_POS_GENERATION: usize = 3;
pub const BYTE_POS_KEY_COUNT: usize = 7;
pub const BYTE_POS_RIGHT_SIBLING: usize = 11;
pub const BYTE_POS_LEFT_SIBLING: usize = BYTE_POS_RIGHT_SIBLING + GSPP_SIZE;
pub const BYTE_POS_SUCCESSOR: usize = BYTE_POS_LEFT_SIBLING + GSPP_SIZE;
pub const HEADER_LENGTH: usize = BYTE_POS_SUCCESSOR + GSPP_SIZE;

pub const NODE_TYPE_TREE_NODE: u8 = 1;
pub const NODE_TYPE_FREE_LIST_NODE: u8 = 2;

pub const ROOT_LAYER_FLAG: u8 = 0;
pub const DATA_LAYER_FLAG: u8 = 1;

pub const LEAF_FLAG: u8 = 1;
pub const INTERNAL_FLAG: u8 = 0;

/// Header GSPPs present on every tree node, in scan order.
pub const HEADER_POINTER_OFFSETS: [usize; 3] = [
    BYTE_POS_SUCCESSOR,
    BYTE_POS_LEFT_SIBLING,
    BYTE_POS_RIGHT_SIBLING,
];

/// Which tree a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Root,
    Data,
}

impl Layer {
    /// Decode a layer byte. Anything but the data flag is the root layer.
    #[must_use]
    pub const fn from_flag(flag: u8) -> Self {
        if flag == DATA_LAYER_FLAG {
            Self::Data
        } else {
            Self::Root
        }
    }

    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Root => ROOT_LAYER_FLAG,
            Self::Data => DATA_LAYER_FLAG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    Left,
    Right,
}

impl Sibling {
    const fn offset(self) -> usize {
        match self {
            Self::Left => BYTE_POS_LEFT_SIBLING,
            Self::Right => BYTE_POS_RIGHT_SIBLING,
        }
    }
}

pub fn node_type<C: PageCursor>(cursor: &mut C) -> u8 {
    cursor.get_u8_at(BYTE_POS_NODE_TYPE)
}

pub fn layer_type<C: PageCursor>(cursor: &mut C) -> u8 {
    cursor.get_u8_at(BYTE_POS_LAYER_TYPE)
}

pub fn is_leaf<C: PageCursor>(cursor: &mut C) -> bool {
    cursor.get_u8_at(BYTE_POS_TYPE) == LEAF_FLAG
}

pub fn is_internal<C: PageCursor>(cursor: &mut C) -> bool {
    cursor.get_u8_at(BYTE_POS_TYPE) == INTERNAL_FLAG
}

pub fn key_count<C: PageCursor>(cursor: &mut C) -> u32 {
    cursor.get_u32_at(BYTE_POS_KEY_COUNT)
}

pub fn node_generation<C: PageCursor>(cursor: &mut C) -> Generation {
    Generation::from(cursor.get_u32_at(BYTE_POS_GENERATION))
}

/// Write a fresh tree node header: no keys, no siblings, no successor.
pub fn initialize_node<C: PageCursor>(
    cursor: &mut C,
    layer: Layer,
    leaf: bool,
    generation: Generation,
) -> Result<(), PointerError> {
    if !(MIN_GENERATION..=MAX_GENERATION).contains(&generation) {
        return Err(PointerError::InvalidGeneration(generation));
    }
    cursor.set_offset(BYTE_POS_NODE_TYPE);
    cursor.put_u8(NODE_TYPE_TREE_NODE);
    cursor.put_u8(layer.flag());
    cursor.put_u8(if leaf { LEAF_FLAG } else { INTERNAL_FLAG });
    cursor.put_u32(generation as u32);
    cursor.put_u32(0);
    cursor.put_bytes(&[0u8; 3 * GSPP_SIZE]);
    Ok(())
}

pub fn set_key_count<C: PageCursor>(cursor: &mut C, count: u32) {
    cursor.put_u32_at(BYTE_POS_KEY_COUNT, count);
}

pub fn set_sibling<C: PageCursor>(
    cursor: &mut C,
    sibling: Sibling,
    id: u64,
    bracket: &GenerationBracket,
) -> Result<Slot, PointerError> {
    GenerationSafePointerPair::write(cursor, sibling.offset(), id, bracket)
}

pub fn sibling<C: PageCursor>(
    cursor: &mut C,
    sibling: Sibling,
    bracket: &GenerationBracket,
) -> Result<Option<u64>, PointerError> {
    GenerationSafePointerPair::read_from(cursor, sibling.offset()).current(bracket)
}

pub fn set_successor<C: PageCursor>(
    cursor: &mut C,
    id: u64,
    bracket: &GenerationBracket,
) -> Result<Slot, PointerError> {
    GenerationSafePointerPair::write(cursor, BYTE_POS_SUCCESSOR, id, bracket)
}

pub fn successor<C: PageCursor>(
    cursor: &mut C,
    bracket: &GenerationBracket,
) -> Result<Option<u64>, PointerError> {
    GenerationSafePointerPair::read_from(cursor, BYTE_POS_SUCCESSOR).current(bracket)
}

/// Key and child placement for one node flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNodeLayout {
    page_size: usize,
    key_size: usize,
    value_size: usize,
    internal_max_key_count: usize,
    leaf_max_key_count: usize,
}

impl TreeNodeLayout {
    /// Smallest number of keys an internal node must be able to hold.
    pub const MIN_INTERNAL_KEYS: usize = 2;

    pub fn new(page_size: usize, key_size: usize, value_size: usize) -> Result<Self, LayoutError> {
        if key_size == 0 {
            return Err(LayoutError::ZeroKeySize);
        }
        let internal_max_key_count = page_size
            .saturating_sub(HEADER_LENGTH + GSPP_SIZE)
            / (key_size + GSPP_SIZE);
        if internal_max_key_count < Self::MIN_INTERNAL_KEYS {
            return Err(LayoutError::PageTooSmall {
                page_size,
                key_size,
                internal_max_key_count,
            });
        }
        let leaf_max_key_count = page_size.saturating_sub(HEADER_LENGTH) / (key_size + value_size);
        Ok(Self {
            page_size,
            key_size,
            value_size,
            internal_max_key_count,
            leaf_max_key_count,
        })
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn key_size(&self) -> usize {
        self.key_size
    }

    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.value_size
    }

    #[must_use]
    pub const fn internal_max_key_count(&self) -> usize {
        self.internal_max_key_count
    }

    #[must_use]
    pub const fn leaf_max_key_count(&self) -> usize {
        self.leaf_max_key_count
    }

    #[must_use]
    pub const fn key_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + pos * self.key_size
    }

    /// Offset of child GSPP `pos`, for `pos` in `0..=key_count`.
    #[must_use]
    pub const fn child_offset(&self, pos: usize) -> usize {
        HEADER_LENGTH + self.internal_max_key_count * self.key_size + pos * GSPP_SIZE
    }

    /// Whether child `pos` can exist in an internal node of this layout.
    ///
    /// Bounds child scans driven by a key count read from a possibly corrupt
    /// page.
    #[must_use]
    pub const fn reasonable_child_count(&self, pos: usize) -> bool {
        pos <= self.internal_max_key_count
    }

    pub fn set_child<C: PageCursor>(
        &self,
        cursor: &mut C,
        pos: usize,
        child_id: u64,
        bracket: &GenerationBracket,
    ) -> Result<Slot, LayoutError> {
        self.check_child_pos(pos)?;
        Ok(GenerationSafePointerPair::write(
            cursor,
            self.child_offset(pos),
            child_id,
            bracket,
        )?)
    }

    pub fn child<C: PageCursor>(
        &self,
        cursor: &mut C,
        pos: usize,
        bracket: &GenerationBracket,
    ) -> Result<Option<u64>, LayoutError> {
        self.check_child_pos(pos)?;
        Ok(GenerationSafePointerPair::read_from(cursor, self.child_offset(pos)).current(bracket)?)
    }

    const fn check_child_pos(&self, pos: usize) -> Result<(), LayoutError> {
        if self.reasonable_child_count(pos) {
            Ok(())
        } else {
            Err(LayoutError::ChildOutOfRange {
                pos,
                max: self.internal_max_key_count,
            })
        }
    }
}

/// Errors that can occur when building or addressing a node layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    ZeroKeySize,
    /// Internal nodes could not hold enough keys.
    PageTooSmall {
        page_size: usize,
        key_size: usize,
        internal_max_key_count: usize,
    },
    ChildOutOfRange {
        pos: usize,
        max: usize,
    },
    Pointer(PointerError),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroKeySize => write!(f, "key size must be non-zero"),
            Self::PageTooSmall {
                page_size,
                key_size,
                internal_max_key_count,
            } => write!(
                f,
                "page size {page_size} fits only {internal_max_key_count} internal keys of size {key_size}, need at least {}",
                TreeNodeLayout::MIN_INTERNAL_KEYS
            ),
            Self::ChildOutOfRange { pos, max } => {
                write!(f, "child position {pos} beyond max key count {max}")
            }
            Self::Pointer(e) => write!(f, "child pointer: {e}"),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pointer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PointerError> for LayoutError {
    fn from(e: PointerError) -> Self {
        Self::Pointer(e)
    }
}
