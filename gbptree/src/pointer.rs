//! Generation safe pointers (GSP) and pointer pairs (GSPP).
//!
//! # Wire Format
//!
//! A GSP is 12 bytes, little-endian:
//!
//! - `generation`: 4 bytes
//! - `pointer`: 6 bytes
//! - `checksum`: 2 bytes (low 16 bits of the CRC32 of the 10 bytes above)
//!
//! A GSPP is two GSPs back to back (slot A, then slot B). Updating a pointer
//! writes the half that does not hold the last checkpointed value, so a crash
//! mid-write can at worst damage a half that is not needed for recovery.
//!
//! The empty pointer is 12 zero bytes. It is also what crash cleaning writes
//! over a pointer from a crash generation.

// Generations are validated against MAX_GENERATION (u32) before encoding.
#![allow(clippy::cast_possible_truncation)]

use crate::generation::{Generation, GenerationBracket, MAX_GENERATION, MIN_GENERATION};
use crate::page_cache::PageCursor;

/// Size of one GSP in bytes.
pub const GSP_SIZE: usize = 12;

/// Size of one GSPP in bytes.
pub const GSPP_SIZE: usize = 2 * GSP_SIZE;

/// Largest pointer that fits the 6 byte field.
pub const MAX_POINTER: u64 = (1 << 48) - 1;

/// Read the generation stamp at the cursor's current offset.
///
/// Leaves the cursor just past the generation field.
pub fn read_generation<C: PageCursor>(cursor: &mut C) -> Generation {
    Generation::from(cursor.get_u32())
}

/// Overwrite the GSP at the cursor's current offset with the empty pointer.
pub fn clean<C: PageCursor>(cursor: &mut C) {
    cursor.put_bytes(&[0u8; GSP_SIZE]);
}

/// Checksum over the encoded generation and pointer.
#[must_use]
pub fn checksum_of(generation: Generation, pointer: u64) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(generation as u32).to_le_bytes());
    hasher.update(&pointer.to_le_bytes()[..6]);
    (hasher.finalize() & 0xFFFF) as u16
}

/// One decoded pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSafePointer {
    generation: Generation,
    pointer: u64,
    checksum: u16,
}

impl GenerationSafePointer {
    /// The empty (tombstone) pointer.
    pub const EMPTY: Self = Self {
        generation: 0,
        pointer: 0,
        checksum: 0,
    };

    /// Build a pointer with a freshly computed checksum.
    pub fn new(generation: Generation, pointer: u64) -> Result<Self, PointerError> {
        if !(MIN_GENERATION..=MAX_GENERATION).contains(&generation) {
            return Err(PointerError::InvalidGeneration(generation));
        }
        if pointer > MAX_POINTER {
            return Err(PointerError::PointerTooLarge(pointer));
        }
        Ok(Self {
            generation,
            pointer,
            checksum: checksum_of(generation, pointer),
        })
    }

    /// Decode the GSP at the cursor's current offset.
    pub fn read_from<C: PageCursor>(cursor: &mut C) -> Self {
        let generation = read_generation(cursor);
        let pointer = cursor.get_u48();
        let checksum = cursor.get_u16();
        Self {
            generation,
            pointer,
            checksum,
        }
    }

    /// Encode at the cursor's current offset.
    pub fn write_to<C: PageCursor>(&self, cursor: &mut C) {
        cursor.put_u32(self.generation as u32);
        cursor.put_u48(self.pointer);
        cursor.put_u16(self.checksum);
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub const fn pointer(&self) -> u64 {
        self.pointer
    }

    #[must_use]
    pub const fn checksum(&self) -> u16 {
        self.checksum
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    #[must_use]
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum == checksum_of(self.generation, self.pointer)
    }

    /// Classify this slot against the active bracket.
    #[must_use]
    pub fn state(&self, bracket: &GenerationBracket) -> SlotState {
        if self.is_empty() {
            SlotState::Empty
        } else if !self.is_checksum_valid()
            || self.generation < MIN_GENERATION
            || self.generation > bracket.unstable()
        {
            SlotState::Broken
        } else if bracket.is_crashed(self.generation) {
            SlotState::Crashed
        } else if bracket.is_unstable(self.generation) {
            SlotState::Unstable
        } else {
            SlotState::Stable
        }
    }
}

/// State of one GSPP half relative to a generation bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written, or cleaned.
    Empty,
    /// Checksum mismatch or impossible generation (torn write).
    Broken,
    /// Written by a generation that crashed.
    Crashed,
    /// Written by a checkpointed generation.
    Stable,
    /// Written by the ongoing generation.
    Unstable,
}

/// Which half of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// Byte offset of this half relative to the start of the pair.
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => GSP_SIZE,
        }
    }
}

/// Both halves of one logical pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSafePointerPair {
    pub slot_a: GenerationSafePointer,
    pub slot_b: GenerationSafePointer,
}

impl GenerationSafePointerPair {
    /// Decode the pair starting at `offset`.
    pub fn read_from<C: PageCursor>(cursor: &mut C, offset: usize) -> Self {
        cursor.set_offset(offset);
        let slot_a = GenerationSafePointer::read_from(cursor);
        let slot_b = GenerationSafePointer::read_from(cursor);
        Self { slot_a, slot_b }
    }

    /// The pointer a reader should follow, if any.
    ///
    /// Prefers the half written in the unstable generation, then the newest
    /// stable half. Crashed and broken halves are never returned.
    pub fn current(&self, bracket: &GenerationBracket) -> Result<Option<u64>, PointerError> {
        let a = self.slot_a.state(bracket);
        let b = self.slot_b.state(bracket);
        let slot = match (a, b) {
            (SlotState::Empty, SlotState::Empty) => return Ok(None),
            (SlotState::Unstable, SlotState::Unstable) => {
                return Err(PointerError::Ambiguous { slot_a: a, slot_b: b });
            }
            (SlotState::Unstable, _) => Slot::A,
            (_, SlotState::Unstable) => Slot::B,
            (SlotState::Stable, SlotState::Stable) => self.newest_stable(a, b)?,
            (SlotState::Stable, _) => Slot::A,
            (_, SlotState::Stable) => Slot::B,
            _ => return Err(PointerError::NoValidSlot { slot_a: a, slot_b: b }),
        };
        Ok(Some(self.slot(slot).pointer))
    }

    /// Which half a write in the unstable generation goes to.
    ///
    /// Overwrites the unstable half if there is one, otherwise whichever half
    /// is not the newest stable pointer.
    pub fn slot_to_write(&self, bracket: &GenerationBracket) -> Result<Slot, PointerError> {
        let a = self.slot_a.state(bracket);
        let b = self.slot_b.state(bracket);
        match (a, b) {
            (SlotState::Unstable, SlotState::Unstable) => {
                Err(PointerError::Ambiguous { slot_a: a, slot_b: b })
            }
            (SlotState::Unstable, _) => Ok(Slot::A),
            (_, SlotState::Unstable) => Ok(Slot::B),
            (SlotState::Stable, SlotState::Stable) => match self.newest_stable(a, b)? {
                Slot::A => Ok(Slot::B),
                Slot::B => Ok(Slot::A),
            },
            (SlotState::Stable, _) => Ok(Slot::B),
            _ => Ok(Slot::A),
        }
    }

    /// Write `pointer` in the unstable generation into the pair at `offset`.
    pub fn write<C: PageCursor>(
        cursor: &mut C,
        offset: usize,
        pointer: u64,
        bracket: &GenerationBracket,
    ) -> Result<Slot, PointerError> {
        let pair = Self::read_from(cursor, offset);
        let slot = pair.slot_to_write(bracket)?;
        let gsp = GenerationSafePointer::new(bracket.unstable(), pointer)?;
        cursor.set_offset(offset + slot.offset());
        gsp.write_to(cursor);
        Ok(slot)
    }

    #[must_use]
    pub const fn slot(&self, slot: Slot) -> &GenerationSafePointer {
        match slot {
            Slot::A => &self.slot_a,
            Slot::B => &self.slot_b,
        }
    }

    fn newest_stable(&self, a: SlotState, b: SlotState) -> Result<Slot, PointerError> {
        match self.slot_a.generation.cmp(&self.slot_b.generation) {
            std::cmp::Ordering::Greater => Ok(Slot::A),
            std::cmp::Ordering::Less => Ok(Slot::B),
            std::cmp::Ordering::Equal => Err(PointerError::Ambiguous { slot_a: a, slot_b: b }),
        }
    }
}

/// Errors that can occur when encoding or resolving pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerError {
    /// Generation outside the encodable range.
    InvalidGeneration(Generation),
    /// Pointer does not fit in 6 bytes.
    PointerTooLarge(u64),
    /// Both halves claim to be current.
    Ambiguous { slot_a: SlotState, slot_b: SlotState },
    /// Neither half holds a pointer that may be followed.
    NoValidSlot { slot_a: SlotState, slot_b: SlotState },
}

impl std::fmt::Display for PointerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidGeneration(generation) => {
                write!(f, "invalid pointer generation: {generation}")
            }
            Self::PointerTooLarge(pointer) => {
                write!(f, "pointer {pointer} exceeds max {MAX_POINTER}")
            }
            Self::Ambiguous { slot_a, slot_b } => {
                write!(f, "ambiguous pointer pair: A={slot_a:?}, B={slot_b:?}")
            }
            Self::NoValidSlot { slot_a, slot_b } => {
                write!(f, "no valid pointer in pair: A={slot_a:?}, B={slot_b:?}")
            }
        }
    }
}

impl std::error::Error for PointerError {}
