//! Generation arithmetic.
//!
//! Every checkpoint and every restart moves the tree to a new generation.
//! Pointers are stamped with the generation they were written in, so a
//! reader can tell from the stamp alone whether a pointer was made durable
//! by a checkpoint, belongs to the ongoing generation, or was written by a
//! generation that never finished.
//!
//! # Invariants
//!
//! - `MIN_GENERATION <= stable < unstable <= MAX_GENERATION`
//! - Generation `0` only ever appears in an empty (tombstone) pointer

/// A generation number. Stored as an unsigned 32 bit value on disk.
pub type Generation = u64;

/// Smallest generation a live pointer can carry.
pub const MIN_GENERATION: Generation = 1;

/// Largest generation that fits the on-disk field.
pub const MAX_GENERATION: Generation = u32::MAX as Generation;

/// The `(stable, unstable)` pair a tree is currently operating under.
///
/// Generations strictly between the two are crash generations: a checkpoint
/// started writing them but never completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationBracket {
    stable: Generation,
    unstable: Generation,
}

impl GenerationBracket {
    /// Create a bracket for normal operation.
    ///
    /// # Errors
    ///
    /// Returns an error if either generation is out of range or if
    /// `unstable <= stable`.
    pub fn new(stable: Generation, unstable: Generation) -> Result<Self, GenerationError> {
        for generation in [stable, unstable] {
            if !(MIN_GENERATION..=MAX_GENERATION).contains(&generation) {
                return Err(GenerationError::OutOfRange(generation));
            }
        }
        if unstable <= stable {
            return Err(GenerationError::Unordered { stable, unstable });
        }
        Ok(Self { stable, unstable })
    }

    /// Create a bracket suitable for crash cleaning.
    ///
    /// Cleaning only makes sense when there is room for at least one crash
    /// generation, i.e. `unstable - stable > 1`.
    pub fn for_crash_cleaning(
        stable: Generation,
        unstable: Generation,
    ) -> Result<Self, GenerationError> {
        let bracket = Self::new(stable, unstable)?;
        if unstable - stable <= 1 {
            return Err(GenerationError::NoCrashGeneration { stable, unstable });
        }
        Ok(bracket)
    }

    #[must_use]
    pub const fn stable(&self) -> Generation {
        self.stable
    }

    #[must_use]
    pub const fn unstable(&self) -> Generation {
        self.unstable
    }

    /// A pointer stamped with a crash generation must never be followed.
    #[must_use]
    pub const fn is_crashed(&self, generation: Generation) -> bool {
        generation > self.stable && generation < self.unstable
    }

    #[must_use]
    pub const fn is_stable(&self, generation: Generation) -> bool {
        generation >= MIN_GENERATION && generation <= self.stable
    }

    #[must_use]
    pub const fn is_unstable(&self, generation: Generation) -> bool {
        generation == self.unstable
    }
}

/// Errors that can occur when building a generation bracket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Generation outside `MIN_GENERATION..=MAX_GENERATION`.
    OutOfRange(Generation),
    /// Unstable generation not greater than stable generation.
    Unordered {
        stable: Generation,
        unstable: Generation,
    },
    /// No generation fits strictly between stable and unstable.
    NoCrashGeneration {
        stable: Generation,
        unstable: Generation,
    },
}

impl std::fmt::Display for GenerationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange(generation) => write!(
                f,
                "generation {generation} outside of [{MIN_GENERATION}, {MAX_GENERATION}]"
            ),
            Self::Unordered { stable, unstable } => write!(
                f,
                "unexpected generations, stableGeneration={stable}, unstableGeneration={unstable}"
            ),
            Self::NoCrashGeneration { stable, unstable } => write!(
                f,
                "no crash generation between stableGeneration={stable} and unstableGeneration={unstable}"
            ),
        }
    }
}

impl std::error::Error for GenerationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_predicate_is_exclusive_on_both_ends() {
        let bracket = GenerationBracket::new(5, 8).unwrap();
        assert!(!bracket.is_crashed(5));
        assert!(bracket.is_crashed(6));
        assert!(bracket.is_crashed(7));
        assert!(!bracket.is_crashed(8));
        assert!(!bracket.is_crashed(0));
    }

    #[test]
    fn test_stable_and_unstable_predicates() {
        let bracket = GenerationBracket::new(5, 8).unwrap();
        assert!(bracket.is_stable(1));
        assert!(bracket.is_stable(5));
        assert!(!bracket.is_stable(0));
        assert!(!bracket.is_stable(6));
        assert!(bracket.is_unstable(8));
        assert!(!bracket.is_unstable(7));
    }

    #[test]
    fn test_bracket_rejects_bad_ordering() {
        assert_eq!(
            GenerationBracket::new(8, 8),
            Err(GenerationError::Unordered {
                stable: 8,
                unstable: 8
            })
        );
        assert!(GenerationBracket::new(9, 8).is_err());
        assert_eq!(
            GenerationBracket::new(0, 8),
            Err(GenerationError::OutOfRange(0))
        );
        assert!(GenerationBracket::new(1, MAX_GENERATION + 1).is_err());
    }

    #[test]
    fn test_cleaning_bracket_needs_a_crash_generation() {
        assert_eq!(
            GenerationBracket::for_crash_cleaning(5, 6),
            Err(GenerationError::NoCrashGeneration {
                stable: 5,
                unstable: 6
            })
        );
        assert!(GenerationBracket::for_crash_cleaning(5, 7).is_ok());
    }
}
