//! Runtime trait for abstracting away OS-esque features so components can be
//! driven by a real tokio executor in production and a paused clock in tests.

use std::{
    future::Future,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    select_biased,
    FutureExt,
};
use rand::RngCore;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Task canceled")]
    Canceled,
    #[error("Task panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e:?}"))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// A Runtime can be considered somewhat like an operating system abstraction
/// for our codebase. Functionality like time, randomness, and task spawning
/// goes through this trait so components under test can run against tokio's
/// paused clock and a seeded RNG.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Return the wall-clock time. Compare with `std::time::UNIX_EPOCH` to
    /// obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp(
            self.system_time()
                .duration_since(UNIX_EPOCH)
                .expect("Failed to compute unix timestamp"),
        )
    }

    /// Return a reading from the executor's monotonic clock. Under
    /// `tokio::test(start_paused = true)` this is virtual time.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// Use the runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore>;
}

/// Abstraction over a unix timestamp. Internally it stores a Duration since
/// the unix epoch.
///
/// Serializes as integer milliseconds since the epoch, which is the wire
/// format for records at sink and dead-letter boundaries.
///
/// NOTE: Only works for timestamps past the UNIX_EPOCH.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn from_secs_f64(secs: f64) -> Self {
        UnixTimestamp(Duration::from_secs_f64(secs))
    }

    pub fn from_nanos(nanos: u64) -> Self {
        UnixTimestamp(Duration::from_nanos(nanos))
    }

    pub fn from_millis(ms: u64) -> Self {
        UnixTimestamp(Duration::from_millis(ms))
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn as_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.0
    }

    pub fn as_ms_since_epoch(&self) -> u64 {
        self.0.as_millis().try_into().unwrap_or(u64::MAX)
    }

    pub fn checked_sub(&self, rhs: UnixTimestamp) -> Option<Duration> {
        self.0.checked_sub(rhs.0)
    }

    pub fn saturating_sub(&self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0.saturating_sub(rhs))
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_ms_since_epoch())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(UnixTimestamp::from_millis(ms))
    }
}

impl Sub<UnixTimestamp> for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: UnixTimestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + rhs)
    }
}

impl Sub<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn sub(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 - rhs)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("'{description}' timeout after {duration:?}")]
pub struct TimeoutError {
    pub description: &'static str,
    pub duration: Duration,
}

pub trait WithTimeout {
    fn with_timeout<'a, T>(
        &'a self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send + 'a,
    ) -> BoxFuture<'a, anyhow::Result<T>>
    where
        T: Send + 'a;
}

impl<RT: Runtime> WithTimeout for RT {
    fn with_timeout<'a, T>(
        &'a self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send + 'a,
    ) -> BoxFuture<'a, anyhow::Result<T>>
    where
        T: Send + 'a,
    {
        async move {
            select_biased! {
                result = fut.fuse() => result,
                _ = self.wait(duration) => {
                    anyhow::bail!(TimeoutError{description, duration});
                },
            }
        }
        .boxed()
    }
}
