use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tracing::error;

// Use Arc to wrap the Runtime for safe sharing across threads
static RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

pub fn async_init() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("snailshell")
        .build()
        .map_err(|e| anyhow!("Failed to build runtime: {}", e))?;

    let rt = Arc::new(rt);
    *RUNTIME.lock() = Some(rt);
    Ok(())
}

fn runtime() -> Option<Arc<Runtime>> {
    RUNTIME.lock().as_ref().cloned()
}

/// Drops the global runtime. Must not be called from within an async context.
pub fn shutdown() {
    RUNTIME.lock().take();
}

/// Blocks the calling thread on `async_fn`. Must not be called from within
/// an async context.
pub fn async_exec<R, F>(async_fn: F) -> Result<R>
where
    R: 'static,
    F: Future<Output = R> + 'static,
{
    let rt = runtime().ok_or_else(|| anyhow!("Runtime not initialized"))?;
    Ok(rt.block_on(async_fn))
}

/// Spawns on the global runtime, or on the ambient one when the global
/// runtime was never initialized.
pub fn async_spawn<F>(async_fn: F) -> Result<tokio::task::JoinHandle<()>>
where
    F: Future<Output = ()> + 'static + Send,
{
    if let Some(rt) = runtime() {
        return Ok(rt.spawn(async_fn));
    }
    match Handle::try_current() {
        Ok(handle) => Ok(handle.spawn(async_fn)),
        Err(e) => {
            error!("No runtime available to spawn task: {}", e);
            Err(anyhow!("Runtime not initialized: {}", e))
        }
    }
}
