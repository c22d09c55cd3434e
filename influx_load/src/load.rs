//! A single load run against an InfluxDB instance.
//!
//! The run is linear: validate configuration, make sure the database exists,
//! give the server a moment to create the default retention policy, then
//! generate and write batches until every row is written or the run is
//! interrupted.

use std::{future::Future, sync::Arc};

use influx_load_payload::{Batches, Generator, SystemClock};
use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    client::{self, Client, Database},
    config::{self, Config},
    writer::{self, Report},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`run`].
pub enum Error {
    /// See [`crate::config::Error`] for details.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    /// See [`crate::client::Error`] for details.
    #[error("Client error: {0}")]
    Client(#[from] client::Error),
    /// See [`influx_load_payload::Error`] for details.
    #[error("Payload error: {0}")]
    Payload(#[from] influx_load_payload::Error),
    /// See [`crate::writer::Error`] for details.
    #[error(transparent)]
    Writer(#[from] writer::Error),
    /// At least one batch was not written.
    #[error("{failed} of {total} batches failed to write")]
    WriteFailures {
        /// Number of failed batches
        failed: u64,
        /// Number of dispatched batches
        total: u64,
    },
}

/// Run one load test described by `config`.
///
/// `shutdown` stops the run when it resolves. Before the first write this
/// returns an empty, interrupted [`Report`]; afterwards the dispatch of new
/// batches stops and writes in flight are awaited.
///
/// # Errors
///
/// Function will return an error if the configuration is invalid, the
/// database cannot be created or if any batch failed to write.
pub async fn run<F>(config: Config, shutdown: F) -> Result<Report, Error>
where
    F: Future<Output = ()>,
{
    config.validate()?;

    let client = Arc::new(Client::new(client::Config {
        host: config.host.clone(),
        database: config.database.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
        request_timeout: config.request_timeout(),
        max_idle_connections: config.concurrency.get(),
    })?);

    tokio::pin!(shutdown);
    let database = tokio::select! {
        biased;

        () = &mut shutdown => return Ok(interrupted_before_writes()),
        database = client.ensure_database() => database?,
    };
    match database {
        Database::Created => info!("Created database {}", client.database()),
        Database::Existing => info!("Database {} already exists", client.database()),
    }

    let settle = config.settle();
    if !settle.is_zero() {
        info!("Waiting {settle:?} for database creation to settle");
        tokio::select! {
            biased;

            () = &mut shutdown => return Ok(interrupted_before_writes()),
            () = tokio::time::sleep(settle) => {}
        }
    }

    let generator = Generator::new(
        config.measurement.as_str(),
        usize::from(config.tags),
        usize::from(config.values.get()),
        config.value_min..config.value_max,
    )?;
    let seed = config.seed.unwrap_or_else(rand::random::<u64>);
    info!(
        seed,
        series = generator.series_cardinality(),
        "Writing {rows} rows in {batches} batches of up to {batch} rows",
        rows = config.rows,
        batches = Batches::<StdRng, SystemClock>::total(config.rows, config.batch),
        batch = config.batch,
    );

    let batches = Batches::new(
        generator,
        StdRng::seed_from_u64(seed),
        SystemClock,
        config.rows,
        config.batch,
    );
    let writer_config = writer::Config {
        concurrency: config.concurrency,
        fail_fast: config.fail_fast,
    };

    let started = Instant::now();
    let report = writer::run(client, batches, writer_config, shutdown.as_mut()).await?;
    let elapsed = started.elapsed();

    let rate = report.points_written as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        batches_ok = report.batches_ok,
        batches_failed = report.batches_failed,
        bytes = report.bytes_written,
        interrupted = report.interrupted,
        "Wrote {points} rows in {elapsed:?} ({rate:.0} rows/s)",
        points = report.points_written,
    );

    if report.is_success() {
        return Ok(report);
    }
    for failure in &report.failures {
        match failure.batch {
            Some(batch) => error!("batch {batch}: {}", failure.message),
            None => error!("{}", failure.message),
        }
    }
    Err(Error::WriteFailures {
        failed: report.batches_failed,
        total: report.batches_dispatched,
    })
}

fn interrupted_before_writes() -> Report {
    info!("shutdown signal received before the first write");
    Report {
        interrupted: true,
        ..Report::default()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::{NonZeroU16, NonZeroU64, NonZeroUsize},
        time::Duration,
    };

    use hyper::StatusCode;

    use super::{Error, run};
    use crate::{
        client,
        config::Config,
        test::server::{Received, Reply, Server},
    };

    const CREATED: &str = r#"{"results":[{"statement_id":0}]}"#;
    const EXISTS: &str = r#"{"results":[{"statement_id":0,"error":"database already exists"}]}"#;

    fn config(host: String) -> Config {
        Config {
            host,
            tags: 3,
            values: NonZeroU16::new(2).expect("non-zero"),
            rows: 10,
            batch: NonZeroU64::new(4).expect("non-zero"),
            concurrency: NonZeroUsize::new(2).expect("non-zero"),
            settle_millis: 0,
            seed: Some(7),
            ..Config::default()
        }
    }

    fn influx(database: &'static str) -> impl Fn(&Received) -> Reply + Send + Sync + 'static {
        move |request: &Received| match request.path.as_str() {
            "/query" => Reply::json(StatusCode::OK, database),
            _ => Reply::empty(StatusCode::NO_CONTENT),
        }
    }

    fn lines(server: &Server) -> Vec<String> {
        server
            .received()
            .iter()
            .filter(|r| r.path == "/write")
            .flat_map(|r| {
                std::str::from_utf8(&r.body)
                    .expect("utf-8 body")
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_every_row_including_the_partial_batch() {
        let server = Server::spawn(influx(CREATED)).await;
        let report = run(config(server.uri()), std::future::pending())
            .await
            .expect("run failed");

        assert_eq!(report.batches_dispatched, 3);
        assert_eq!(report.batches_ok, 3);
        assert_eq!(report.points_written, 10);

        let received = server.received();
        assert_eq!(received[0].path, "/query");
        assert_eq!(received.iter().filter(|r| r.path == "/write").count(), 3);

        let lines = lines(&server);
        assert_eq!(lines.len(), 10);
        for line in &lines {
            let mut parts = line.split(' ');
            let series = parts.next().expect("series key");
            let fields = parts.next().expect("field set");
            assert!(series.starts_with("p1,rack="));
            assert!(series.contains(",region=") && series.contains(",row="));
            assert_eq!(series.matches(',').count(), 3);
            assert!(fields.starts_with("v1=") && fields.contains(",v2="));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existing_database_is_not_an_error() {
        let server = Server::spawn(influx(EXISTS)).await;
        let report = run(config(server.uri()), std::future::pending())
            .await
            .expect("run failed");
        assert_eq!(report.points_written, 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_seed_same_points() {
        let first = Server::spawn(influx(CREATED)).await;
        let second = Server::spawn(influx(CREATED)).await;
        run(config(first.uri()), std::future::pending())
            .await
            .expect("run failed");
        run(config(second.uri()), std::future::pending())
            .await
            .expect("run failed");

        let strip = |lines: Vec<String>| -> Vec<String> {
            let mut lines: Vec<String> = lines
                .into_iter()
                .map(|l| l.rsplit_once(' ').expect("timestamp").0.to_string())
                .collect();
            lines.sort();
            lines
        };
        assert_eq!(strip(lines(&first)), strip(lines(&second)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_writes_fail_the_run() {
        let server = Server::spawn(|request| match request.path.as_str() {
            "/query" => Reply::json(StatusCode::OK, CREATED),
            _ => Reply::json(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"timeout"}"#),
        })
        .await;

        match run(config(server.uri()), std::future::pending()).await {
            Err(Error::WriteFailures { failed, total }) => {
                assert_eq!(failed, 3);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn setup_failure_skips_writes() {
        let server = Server::spawn(|_| {
            Reply::json(StatusCode::UNAUTHORIZED, r#"{"error":"authorization failed"}"#)
        })
        .await;

        assert!(matches!(
            run(config(server.uri()), std::future::pending()).await,
            Err(Error::Client(client::Error::Status { status: 401, .. }))
        ));
        assert!(server.received().iter().all(|r| r.path != "/write"));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_request() {
        let server = Server::spawn(influx(CREATED)).await;
        let mut config = config(server.uri());
        config.tags = 9;

        assert!(matches!(
            run(config, std::future::pending()).await,
            Err(Error::Config(_))
        ));
        assert!(server.received().is_empty());
    }

    #[tokio::test]
    async fn shutdown_during_settle_skips_writes() {
        let server = Server::spawn(influx(CREATED)).await;
        let mut config = config(server.uri());
        config.settle_millis = 60_000;

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            run(config, tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("shutdown did not cut the settle pause short")
        .expect("run failed");

        assert!(report.interrupted);
        assert_eq!(report.batches_dispatched, 0);
        let received = server.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].path, "/query");
    }

    #[tokio::test]
    async fn zero_rows_only_creates_the_database() {
        let server = Server::spawn(influx(CREATED)).await;
        let mut config = config(server.uri());
        config.rows = 0;

        let report = run(config, std::future::pending())
            .await
            .expect("run failed");
        assert_eq!(report.batches_dispatched, 0);
        assert_eq!(server.received().len(), 1);
    }
}
