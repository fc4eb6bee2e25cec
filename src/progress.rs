//! Progress-callback trait for worker-pool events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as workers move through their shards. Workers run concurrently, so
//! every method may be called from several tasks at once.
//!
//! # Example
//!
//! ```rust
//! use scanfolio::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineProgressCallback for Counter {
//!     fn on_item_complete(&self, worker_id: usize, label: &str) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("[worker {worker_id}] {label} ({done} done)");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the worker pool as it processes shards.
///
/// All methods default to no-ops so implementors override only what they need.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once, after partitioning, before any worker starts.
    fn on_run_start(&self, pending: usize, workers: usize) {
        let _ = (pending, workers);
    }

    /// Called when a worker starts on its shard.
    fn on_worker_start(&self, worker_id: usize, shard_len: usize) {
        let _ = (worker_id, shard_len);
    }

    /// Called when a page's artifact has been written.
    fn on_item_complete(&self, worker_id: usize, label: &str) {
        let _ = (worker_id, label);
    }

    /// Called when a page was found already complete and skipped.
    fn on_item_skipped(&self, worker_id: usize, label: &str) {
        let _ = (worker_id, label);
    }

    /// Called when a page failed transiently; the worker moves on.
    fn on_item_error(&self, worker_id: usize, label: &str, error: &str) {
        let _ = (worker_id, label, error);
    }

    /// Called when a worker stops early (quota exhausted or credential rejected).
    fn on_worker_retired(&self, worker_id: usize, reason: &str) {
        let _ = (worker_id, reason);
    }

    /// Called once after every worker has ended.
    fn on_run_complete(&self, completed: usize, retired_workers: usize) {
        let _ = (completed, retired_workers);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
