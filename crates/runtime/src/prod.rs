//! Production implementation of the Runtime trait.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        JoinError,
        Runtime,
        SpawnHandle,
    },
};
use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use rand::RngCore;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::sleep,
};
use tracing::Instrument;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move { (&mut self.handle).await.map_err(JoinError::from) }.boxed()
    }
}

/// Runtime for running in production that sleeps for wallclock time, doesn't
/// mock out any functionality, etc.
///
/// Under `#[tokio::test(start_paused = true)]` the same type runs against
/// tokio's virtual clock, which is how timing-sensitive tests stay
/// deterministic.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        assert!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`? Use `ProdRuntime::current` instead."
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(*RUNTIME_STACK_SIZE);
        if *RUNTIME_WORKER_THREADS > 0 {
            tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    /// Create a new tokio-based runtime.
    /// Expected usage:
    /// ```text
    /// fn main() -> anyhow::Result<()> {
    ///     let tokio = ProdRuntime::init_tokio()?;
    ///     let rt = ProdRuntime::new(&tokio);
    ///     rt.block_on("main", async {});
    ///     Ok(())
    /// }
    /// ```
    /// The `tokio_rt` should live for the duration of `main`. At the end of
    /// `main` its `Drop` will run and join all spawned futures.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    /// Adopt the ambient tokio runtime. For `#[tokio::main]`/`#[tokio::test]`
    /// contexts.
    pub fn current() -> Self {
        Self {
            rt: TokioRuntimeHandle::current(),
        }
    }

    pub fn block_on<F: Future>(&self, name: &'static str, f: F) -> F::Output {
        let span = tracing::info_span!("task", name);
        self.rt.block_on(f.instrument(span))
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let span = tracing::info_span!("task", name);
        let handle = self.rt.spawn(f.instrument(span));
        Box::new(FutureHandle { handle })
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(rand::rng())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::runtime::{
        shutdown_and_join,
        Runtime,
    };

    use super::ProdRuntime;

    #[tokio::test(start_paused = true)]
    async fn test_wait_uses_virtual_time() {
        let rt = ProdRuntime::current();
        let before = rt.monotonic_now();
        rt.wait(Duration::from_secs(3600)).await;
        assert!(rt.monotonic_now() - before >= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_spawn_and_join() -> anyhow::Result<()> {
        let rt = ProdRuntime::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = rt.spawn("test_task", async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await?, 42);
        shutdown_and_join(handle).await?;
        Ok(())
    }
}
