//! Shared tokio runtime for platform callback delivery.

use lazy_static::lazy_static;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

lazy_static! {
    static ref RUNTIME: Arc<Runtime> = Arc::new(
        Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("conn-rt")
            .enable_all()
            .build()
            .expect("Failed to build shared runtime")
    );
}

/// Returns the process-wide runtime used to post platform callbacks onto the
/// supervisor's message channel.
pub fn get_runtime() -> Arc<Runtime> {
    RUNTIME.clone()
}
