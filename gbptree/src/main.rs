#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use gbptree::config::RecoveryConfig;
use gbptree::executor::ThreadExecutor;
use gbptree::monitor::{Monitor, TracingMonitor};
use gbptree::page_cache::MemoryPagedFile;
use gbptree::recovery::recover;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gbptree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match RecoveryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: file={}, page_size={}, workers={}",
        config.file.display(),
        config.page_size,
        config.cleaner.workers
    );

    let paged_file = match MemoryPagedFile::open(&config.file, config.page_size) {
        Ok(paged_file) => Arc::new(paged_file),
        Err(e) => {
            tracing::error!("Failed to open {}: {e}", config.file.display());
            std::process::exit(1);
        }
    };

    let tree_name = config
        .file
        .file_name()
        .map_or_else(|| "gbptree".to_string(), |name| name.to_string_lossy().into_owned());
    let monitor: Arc<dyn Monitor> = Arc::new(TracingMonitor::new(tree_name.clone()));

    let outcome = match recover(
        &paged_file,
        &ThreadExecutor,
        monitor,
        &config.cleaner,
        &tree_name,
    ) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Recovery failed: {e}");
            std::process::exit(1);
        }
    };

    if outcome.changed() {
        if let Err(e) = paged_file.flush(&config.file) {
            tracing::error!("Failed to write {}: {e}", config.file.display());
            std::process::exit(1);
        }
    }

    tracing::info!(
        "Recovered: stable_generation={}, unstable_generation={}, pointers_cleaned={}",
        outcome.stable_generation,
        outcome.unstable_generation,
        outcome.cleanup.map_or(0, |summary| summary.pointers_cleaned)
    );
}
