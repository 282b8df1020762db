// Crash recovery for a generation-based B+Tree:
// 1. Read the meta page and the newest valid tree state
// 2. If the tree was not shut down cleanly:
//     - Bracket the crashed generation between stable and a new unstable
//     - Scan every allocated page and zero pointers from crash generations
//     - Persist the new state in the older state page
//
// System components:
//  - Generation safe pointer codec
//  - Tree node layout
//  - Paged file with optimistic read cursors
//  - Parallel crash generation cleaner
#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod cleaner;
pub mod config;
pub mod executor;
pub mod generation;
pub mod lock_client;
pub mod meta;
pub mod monitor;
pub mod node;
pub mod page_cache;
pub mod pointer;
pub mod recovery;
#[cfg(test)]
mod testing;

pub use cleaner::{CleanerError, CleanupSummary, CrashGenerationCleaner};
pub use generation::{Generation, GenerationBracket};
pub use lock_client::{ClientState, LockClientState};
pub use recovery::{RecoveryError, RecoveryOutcome, recover};
