//! Worker configuration.
//!
//! [`WorkerOptions`] is what the protocol handler is built from; it is
//! validated eagerly so a bad concurrency limit fails at construction, before
//! any RPC is attempted. [`CliArgs`] and [`WorkerConfig`] are the binary's
//! view of the same settings, parsed from CLI arguments or environment
//! variables.

use anyhow::Context;
use clap::Parser;
use core::time::Duration;
use taskhub_core::{Error, Result, validate_concurrency};

/// Default advisory limit for concurrent orchestration work items.
pub const DEFAULT_MAX_CONCURRENT_WORK_ITEMS: i32 = 100;

/// Default advisory limit for concurrent activity work items.
pub const DEFAULT_MAX_CONCURRENT_ACTIVITIES: i32 = 100;

/// Default fixed delay between a stream failure and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default upper bound on the wait for in-flight work once the worker stops.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Settled entries are pruned from a tracker once it holds more than this many
/// times the configured limit for its item kind.
pub const PRUNE_MULTIPLIER: usize = 2;

/// Validated settings for a [`ProtocolHandler`](super::protocol::ProtocolHandler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    max_concurrent_work_items: i32,
    max_concurrent_activities: i32,
    reconnect_delay: Duration,
    drain_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_work_items: DEFAULT_MAX_CONCURRENT_WORK_ITEMS,
            max_concurrent_activities: DEFAULT_MAX_CONCURRENT_ACTIVITIES,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl WorkerOptions {
    /// Creates options with the given concurrency limits and default timings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either limit is not positive.
    pub fn new(max_concurrent_work_items: i32, max_concurrent_activities: i32) -> Result<Self> {
        Ok(Self {
            max_concurrent_work_items: validate_concurrency(
                "max_concurrent_work_items",
                max_concurrent_work_items,
            )?,
            max_concurrent_activities: validate_concurrency(
                "max_concurrent_activities",
                max_concurrent_activities,
            )?,
            ..Self::default()
        })
    }

    /// Sets the fixed backoff between reconnect attempts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero delay, which would turn a
    /// persistent transport failure into a busy loop.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Result<Self> {
        if delay.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "reconnect_delay must be greater than 0".to_string(),
            });
        }
        self.reconnect_delay = delay;
        Ok(self)
    }

    /// Sets how long the worker waits for in-flight work after stopping.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub const fn max_concurrent_work_items(&self) -> i32 {
        self.max_concurrent_work_items
    }

    pub const fn max_concurrent_activities(&self) -> i32 {
        self.max_concurrent_activities
    }

    pub const fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub const fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Tracker size above which settled orchestration entries are pruned.
    pub const fn orchestration_prune_threshold(&self) -> usize {
        self.max_concurrent_work_items as usize * PRUNE_MULTIPLIER
    }

    /// Tracker size above which settled activity entries are pruned.
    pub const fn activity_prune_threshold(&self) -> usize {
        self.max_concurrent_activities as usize * PRUNE_MULTIPLIER
    }
}

/// Runtime configuration for the `taskhub-worker` binary.
///
/// All values are parsed from CLI arguments or environment variables. A `.env`
/// file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "taskhub-worker",
    version,
    about = "A streaming worker for a task-hub coordinator"
)]
pub struct CliArgs {
    /// Address of the task-hub coordinator (sidecar) gRPC endpoint.
    ///
    /// Environment variable: `TASKHUB_ADDRESS`
    #[arg(long, env = "TASKHUB_ADDRESS", default_value_t = String::from("http://127.0.0.1:50001"))]
    pub address: String,

    /// Maximum number of orchestration work items the coordinator should hand
    /// this worker at once. Advisory; sent upstream on every connect.
    ///
    /// Environment variable: `MAX_CONCURRENT_WORK_ITEMS`
    #[arg(long, env = "MAX_CONCURRENT_WORK_ITEMS", default_value_t = DEFAULT_MAX_CONCURRENT_WORK_ITEMS)]
    pub max_concurrent_work_items: i32,

    /// Maximum number of activity work items the coordinator should hand this
    /// worker at once. Advisory; sent upstream on every connect.
    ///
    /// Environment variable: `MAX_CONCURRENT_ACTIVITIES`
    #[arg(long, env = "MAX_CONCURRENT_ACTIVITIES", default_value_t = DEFAULT_MAX_CONCURRENT_ACTIVITIES)]
    pub max_concurrent_activities: i32,

    /// Delay in milliseconds between a lost stream and the next connect.
    ///
    /// Environment variable: `RECONNECT_DELAY_MS`
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value_t = 5_000)]
    pub reconnect_delay_ms: u64,

    /// Upper bound in milliseconds on the wait for in-flight work at shutdown.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_MS`
    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value_t = 3_000)]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub address: String,
    pub options: WorkerOptions,
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> core::result::Result<Self, Self::Error> {
        let options = WorkerOptions::new(
            args.max_concurrent_work_items,
            args.max_concurrent_activities,
        )
        .context("invalid concurrency limits")?
        .with_reconnect_delay(Duration::from_millis(args.reconnect_delay_ms))
        .context("invalid RECONNECT_DELAY_MS")?
        .with_drain_timeout(Duration::from_millis(args.drain_timeout_ms));

        if args.address.is_empty() {
            anyhow::bail!("TASKHUB_ADDRESS must not be empty");
        }

        Ok(Self {
            address: args.address,
            options,
        })
    }
}
