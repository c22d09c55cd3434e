//! Concurrent batch writer.
//!
//! Batches are pulled one at a time from a lazy source and handed to a
//! [`Sink`], each write in its own task. At most `concurrency` writes are in
//! flight; when that many are outstanding the dispatcher waits for one to
//! finish before pulling the next batch, so no more than `concurrency`
//! batches are held in memory. Writes are never retried. A
//! failure is logged and recorded in the [`Report`] and, unless `fail_fast`
//! is set, the run carries on.
//!
//! ## Metrics
//!
//! `batches_written`: Batches the sink accepted
//! `batches_failed`: Batches the sink rejected
//! `points_written`: Points in accepted batches
//! `bytes_written`: Line protocol bytes in accepted batches
//!

use std::{future::Future, num::NonZeroUsize, sync::Arc};

use async_trait::async_trait;
use influx_load_payload::Batch;
use metrics::counter;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Failures beyond this many are counted but their messages dropped.
pub const MAX_RECORDED_FAILURES: usize = 16;

/// Destination for batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Error produced by a failed write
    type Error: std::error::Error + Send + Sync + 'static;

    /// Write one batch.
    async fn write(&self, batch: &Batch) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`run`].
pub enum Error {
    /// Creation of a batch failed.
    #[error("Batch generation failed: {0}")]
    Payload(#[from] influx_load_payload::Error),
}

/// Configuration for [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of writes in flight
    pub concurrency: NonZeroUsize,
    /// Stop dispatching after the first observed failure
    pub fail_fast: bool,
}

/// A failed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Index of the failed batch, absent if its task panicked
    pub batch: Option<u64>,
    /// What went wrong
    pub message: String,
}

/// Summary of a writer run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    /// Batches handed to the sink
    pub batches_dispatched: u64,
    /// Batches the sink accepted
    pub batches_ok: u64,
    /// Batches the sink rejected
    pub batches_failed: u64,
    /// Points in accepted batches
    pub points_written: u64,
    /// Bytes in accepted batches
    pub bytes_written: u64,
    /// The first [`MAX_RECORDED_FAILURES`] failures
    pub failures: Vec<Failure>,
    /// Dispatch ended because of the shutdown signal
    pub interrupted: bool,
    /// Dispatch ended because of a failure with `fail_fast` set
    pub stopped_early: bool,
}

impl Report {
    /// True if no batch failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.batches_failed == 0
    }

    fn record(&mut self, joined: Result<Outcome, JoinError>) {
        let failure = match joined {
            Ok(Outcome {
                points,
                bytes,
                result: Ok(()),
                ..
            }) => {
                self.batches_ok += 1;
                self.points_written += points;
                self.bytes_written += bytes;
                return;
            }
            Ok(Outcome {
                index,
                result: Err(message),
                ..
            }) => Failure {
                batch: Some(index),
                message,
            },
            Err(err) => {
                error!("Could not join the spawned write task: {err}");
                Failure {
                    batch: None,
                    message: err.to_string(),
                }
            }
        };
        self.batches_failed += 1;
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(failure);
        }
    }
}

#[derive(Debug)]
struct Outcome {
    index: u64,
    points: u64,
    bytes: u64,
    result: Result<(), String>,
}

/// Write every batch from `batches` through `sink`.
///
/// Returns once every dispatched write has finished. Dispatch stops early if
/// `shutdown` resolves while waiting for a free slot, or after a failure when
/// `config.fail_fast` is set. Writes already in flight are always awaited.
///
/// # Errors
///
/// Function will return an error if a batch cannot be generated. Failed
/// writes are not errors here, they are reported in the [`Report`].
pub async fn run<S, I, F>(
    sink: Arc<S>,
    batches: I,
    config: Config,
    shutdown: F,
) -> Result<Report, Error>
where
    S: Sink + 'static,
    I: IntoIterator<Item = Result<Batch, influx_load_payload::Error>>,
    F: Future<Output = ()>,
{
    let labels = vec![("component".to_string(), "writer".to_string())];
    let concurrency = config.concurrency.get();
    let mut join_set = JoinSet::new();
    let mut report = Report::default();
    tokio::pin!(shutdown);

    let mut batches = batches.into_iter();
    'dispatch: loop {
        if batches.size_hint().1 == Some(0) {
            break;
        }
        // A batch is only generated once a slot is free for it.
        while join_set.len() >= concurrency {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("shutdown signal received, dispatching no further batches");
                    report.interrupted = true;
                    break 'dispatch;
                }
                Some(joined) = join_set.join_next() => report.record(joined),
            }
        }
        while let Some(joined) = join_set.try_join_next() {
            report.record(joined);
        }
        if config.fail_fast && !report.is_success() {
            warn!("write failure observed, dispatching no further batches");
            report.stopped_early = true;
            break;
        }

        let batch = match batches.next() {
            None => break,
            Some(Ok(batch)) => batch,
            Some(Err(err)) => {
                error!("Discarding run due to batch generation error: {err}");
                while let Some(joined) = join_set.join_next().await {
                    report.record(joined);
                }
                return Err(err.into());
            }
        };

        report.batches_dispatched += 1;
        let sink = Arc::clone(&sink);
        let labels = labels.clone();
        join_set.spawn(async move {
            let index = batch.index;
            let points = batch.points;
            let bytes = batch.bytes.len() as u64;

            debug!("Inserting {points} rows batch {index}");
            let result = match sink.write(&batch).await {
                Ok(()) => {
                    counter!("batches_written", &labels).increment(1);
                    counter!("points_written", &labels).increment(points);
                    counter!("bytes_written", &labels).increment(bytes);
                    Ok(())
                }
                Err(err) => {
                    error!("Failed to write batch {index} of {points} rows: {err}");
                    counter!("batches_failed", &labels).increment(1);
                    Err(err.to_string())
                }
            };
            Outcome {
                index,
                points,
                bytes,
                result,
            }
        });
    }

    while let Some(joined) = join_set.join_next().await {
        report.record(joined);
    }
    Ok(report)
}
