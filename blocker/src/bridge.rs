// ABOUTME: owns the private tokio runtime that backs the synchronous control api.
// ABOUTME: callers block on it; async callers must enter through spawn_blocking.

use std::future::Future;

use tokio::runtime::{Builder, Runtime};

pub struct Bridge {
    runtime: Option<Runtime>,
}

impl Bridge {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("blocker-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Runs `fut` to completion on the bridge runtime, blocking the calling thread.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match &self.runtime {
            Some(runtime) => runtime.block_on(fut),
            None => unreachable!("runtime is only taken during drop"),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Dropping a runtime from inside another runtime's worker panics.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
