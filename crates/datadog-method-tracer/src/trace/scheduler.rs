// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic background tasks.
//!
//! Each task runs one synchronous cycle per period on the tokio runtime. The period is
//! re-read before every sleep so interval changes in the live configuration take effect
//! without a restart. Cancellation is only observed between cycles, so awaiting the join
//! handle after cancelling guarantees no cycle is left half done.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Shortest period a task is scheduled with, whatever its configuration says.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn period(&self) -> Duration;

    fn run_cycle(&self);
}

/// Spawns `task` on the current tokio runtime until `cancel_token` is cancelled.
pub fn spawn_periodic<T>(task: Arc<T>, cancel_token: CancellationToken) -> JoinHandle<()>
where
    T: PeriodicTask + ?Sized,
{
    tokio::spawn(async move {
        debug!("Starting {}", task.name());
        let mut warned = false;
        loop {
            let mut period = task.period();
            if period < MIN_PERIOD {
                if !warned {
                    error!(
                        "{} period {:?} is too short, using {:?}",
                        task.name(),
                        period,
                        MIN_PERIOD
                    );
                    warned = true;
                }
                period = MIN_PERIOD;
            }
            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = tokio::time::sleep(period) => {}
            }
            // A panicking cycle must not take the schedule down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| task.run_cycle())).is_err() {
                error!("{} cycle panicked, continuing with the next cycle", task.name());
            }
        }
        debug!("Stopped {}", task.name());
    })
}
