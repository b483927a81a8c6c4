//! The worker loop driving one collector.
//!
//! Waits on the schedule, runs the due task, routes errors (standoff,
//! re-discovery, no-op), and keeps the metadata matrix and the shared
//! status snapshot current. One loop per collector; tasks of one
//! collector never overlap.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::PollerError;

use super::{Collector, CollectorState};

pub async fn run(mut collector: Collector, cancel: CancellationToken) {
    tracing::info!(collector = %collector.identifier(), "worker started");

    loop {
        let Some((task, wait)) = collector.schedule.next_due() else {
            tracing::error!(collector = %collector.identifier(), "schedule is empty");
            break;
        };
        let task = task.to_string();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let started = Instant::now();
        let result = collector.run_task(&task, &cancel).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                if task == "data" {
                    collector.set_state(CollectorState::Running);
                } else if collector.state() == CollectorState::Failed {
                    collector.set_state(CollectorState::Standby);
                }
                collector.schedule.mark_ran(&task, elapsed, true);
                collector.record_task(&task, elapsed, true).await;
            }
            Err(PollerError::Cancelled) => break,
            Err(e) if e.is_standoff() => {
                collector.set_state(CollectorState::Failed);
                collector.set_last_error(&e);
                collector.schedule.mark_ran(&task, elapsed, false);
                let standoff = collector.schedule.apply_standoff(&task);
                // Retries go through re-init; the session may be dead.
                collector.disconnect();
                tracing::warn!(
                    collector = %collector.identifier(),
                    %task,
                    error = %e,
                    standoff = ?standoff,
                    "cycle failed, standing off"
                );
                collector.record_task(&task, elapsed, false).await;
            }
            Err(e @ PollerError::SchemaConflict(_)) => {
                collector.set_last_error(&e);
                collector.force_rediscovery();
                collector.schedule.mark_ran(&task, elapsed, false);
                tracing::warn!(
                    collector = %collector.identifier(),
                    %task,
                    error = %e,
                    "schema conflict, counters will be re-discovered"
                );
                collector.record_task(&task, elapsed, false).await;
            }
            Err(e @ (PollerError::NoInstances(_) | PollerError::NoMetrics(_))) => {
                collector.log_noop(&e);
                if collector.state() != CollectorState::Failed {
                    collector.set_state(CollectorState::Standby);
                }
                collector.schedule.mark_ran(&task, elapsed, true);
                collector.record_task(&task, elapsed, true).await;
            }
            Err(e) => {
                collector.set_last_error(&e);
                collector.schedule.mark_ran(&task, elapsed, false);
                tracing::error!(
                    collector = %collector.identifier(),
                    %task,
                    kind = e.class(),
                    error = %e,
                    "task failed"
                );
                collector.record_task(&task, elapsed, false).await;
            }
        }

        collector.publish_status().await;
    }

    collector.shutdown().await;
}
