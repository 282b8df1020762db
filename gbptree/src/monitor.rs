//! Cleanup progress reporting.

/// Observer for crash generation cleanup.
pub trait Monitor: Send + Sync {
    fn cleanup_started(&self) {}

    fn cleanup_finished(
        &self,
        _pages_to_clean: u64,
        _tree_nodes_found: u64,
        _pointers_cleaned: u64,
        _elapsed_ms: u64,
    ) {
    }
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {}

/// Logs cleanup events through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingMonitor {
    tree_name: String,
}

impl TracingMonitor {
    #[must_use]
    pub fn new(tree_name: impl Into<String>) -> Self {
        Self {
            tree_name: tree_name.into(),
        }
    }
}

impl Monitor for TracingMonitor {
    fn cleanup_started(&self) {
        tracing::info!(tree = %self.tree_name, "crash generation cleanup started");
    }

    fn cleanup_finished(
        &self,
        pages_to_clean: u64,
        tree_nodes_found: u64,
        pointers_cleaned: u64,
        elapsed_ms: u64,
    ) {
        tracing::info!(
            tree = %self.tree_name,
            pages_to_clean,
            tree_nodes_found,
            pointers_cleaned,
            elapsed_ms,
            "crash generation cleanup finished"
        );
    }
}
