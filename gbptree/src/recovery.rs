//! Startup recovery.
//!
//! Reads the tree metadata, and if the tree was not closed cleanly, cleans
//! every pointer written by the crashed generation before the tree is used.
//!
//! # Generations after a crash
//!
//! Suppose the newest state page records stable `S` and unstable `U`. The
//! process crashed while running generation `U`, so every pointer stamped
//! `U` is suspect. Recovery resumes with unstable `U + 1`, which makes `U`
//! (and any older crashed generation) fall strictly between the new stable
//! and unstable generations, where the cleaner finds and zeroes it.
//!
//! The new state is written to the older state page before returning, so a
//! crash before the next checkpoint still brackets `U + 1` correctly.

use std::sync::Arc;

use crate::cleaner::{CleanerError, CleanupSummary, CrashGenerationCleaner};
use crate::config::CleanerConfig;
use crate::executor::Executor;
use crate::generation::{Generation, MAX_GENERATION};
use crate::meta::{
    self, FIRST_TREE_NODE_ID, MetaError, StatePage, TreeState, read_state_pair, write_state,
};
use crate::monitor::Monitor;
use crate::node::LayoutError;
use crate::page_cache::{PageId, PagedFile};

/// Result of a successful recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Stable generation to resume with.
    pub stable_generation: Generation,
    /// Unstable generation to resume with.
    pub unstable_generation: Generation,
    pub root_id: PageId,
    pub last_id: PageId,
    /// State page the resume state was read from.
    pub state_page: StatePage,
    /// Present when the tree was not closed cleanly.
    pub cleanup: Option<CleanupSummary>,
    /// State page rewritten with the resume state, if any.
    pub state_rewritten: Option<StatePage>,
}

impl RecoveryOutcome {
    /// Whether recovery modified the file.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.state_rewritten.is_some()
            || matches!(self.cleanup, Some(summary) if summary.pointers_cleaned > 0)
    }
}

/// Recover a tree after startup.
///
/// # Pre-conditions
/// - Page 0 holds a valid meta page matching the file's page size
/// - At least one state page is valid
///
/// # Post-conditions
/// - On success, no tree node in `[FIRST_TREE_NODE_ID, last_id]` holds a
///   pointer from a crashed generation
/// - On an unclean shutdown, the older state page holds the resume state
pub fn recover<P: PagedFile + 'static>(
    paged_file: &Arc<P>,
    executor: &dyn Executor,
    monitor: Arc<dyn Monitor>,
    config: &CleanerConfig,
    tree_name: &str,
) -> Result<RecoveryOutcome, RecoveryError> {
    let meta = meta::read_meta(paged_file.as_ref())?;
    if meta.page_size as usize != paged_file.page_size() {
        return Err(MetaError::PageSizeMismatch {
            meta: meta.page_size,
            file: paged_file.page_size(),
        }
        .into());
    }
    let (root_layout, data_layout) = meta.layouts()?;

    let (state, state_page) = read_state_pair(paged_file.as_ref())?.newest()?;
    let stable = state.stable_generation;
    let unstable = state
        .unstable_generation
        .checked_add(1)
        .filter(|&generation| generation <= MAX_GENERATION)
        .ok_or(RecoveryError::GenerationOverflow(state.unstable_generation))?;

    let mut outcome = RecoveryOutcome {
        stable_generation: stable,
        unstable_generation: unstable,
        root_id: state.root_id,
        last_id: state.last_id,
        state_page,
        cleanup: None,
        state_rewritten: None,
    };

    if state.clean {
        tracing::info!(
            tree = tree_name,
            stable,
            unstable,
            "tree was shut down cleanly, no crash cleanup needed"
        );
        return Ok(outcome);
    }

    tracing::info!(
        tree = tree_name,
        stable,
        crashed = state.unstable_generation,
        unstable,
        last_id = state.last_id,
        "tree was not shut down cleanly, cleaning crash pointers"
    );
    #[allow(clippy::disallowed_methods)] // Arc::clone for the cleaner
    let cleaner = CrashGenerationCleaner::new(
        Arc::clone(paged_file),
        root_layout,
        data_layout,
        FIRST_TREE_NODE_ID..state.last_id.saturating_add(1),
        stable,
        unstable,
        monitor,
    )
    .with_tree_name(tree_name)
    .with_workers(config.workers);
    outcome.cleanup = Some(cleaner.clean(executor)?);

    let resume_state = TreeState {
        stable_generation: stable,
        unstable_generation: unstable,
        root_id: state.root_id,
        root_generation: state.root_generation,
        last_id: state.last_id,
        clean: false,
    };
    let target = state_page.other();
    write_state(paged_file.as_ref(), target, &resume_state)?;
    outcome.state_rewritten = Some(target);
    tracing::debug!(tree = tree_name, page = target.page_id(), "wrote resume state");

    Ok(outcome)
}

/// Errors that can occur during startup recovery.
#[derive(Debug)]
pub enum RecoveryError {
    Meta(MetaError),
    Layout(LayoutError),
    Cleaner(CleanerError),
    /// Unstable generation cannot be advanced.
    GenerationOverflow(Generation),
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Meta(e) => write!(f, "tree metadata: {e}"),
            Self::Layout(e) => write!(f, "tree layout: {e}"),
            Self::Cleaner(e) => write!(f, "crash generation cleanup: {e}"),
            Self::GenerationOverflow(generation) => write!(
                f,
                "unstable generation {generation} cannot advance past {MAX_GENERATION}"
            ),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Meta(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Cleaner(e) => Some(e),
            Self::GenerationOverflow(_) => None,
        }
    }
}

impl From<MetaError> for RecoveryError {
    fn from(e: MetaError) -> Self {
        Self::Meta(e)
    }
}

impl From<LayoutError> for RecoveryError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<CleanerError> for RecoveryError {
    fn from(e: CleanerError) -> Self {
        Self::Cleaner(e)
    }
}
