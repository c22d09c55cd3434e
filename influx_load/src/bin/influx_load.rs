use std::{
    env,
    ffi::OsString,
    net::SocketAddr,
    num::{NonZeroU16, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    time::Duration,
};

use clap::{Arg, CommandFactory, Parser};
use influx_load::{
    config::{self, Config, Password},
    load,
};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const CONFIG_ENV: &str = "INFLUX_LOAD_CONFIG";

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Load run failed: {0}")]
    Load(#[from] load::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to a YAML configuration file, flags override its values
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// database to insert to
    #[clap(long)]
    database: Option<String>,
    /// host to write to
    #[clap(long)]
    host: Option<String>,
    /// user to authenticate as
    #[clap(long)]
    username: Option<String>,
    /// password for the user
    #[clap(long)]
    password: Option<String>,
    /// number of tags to insert, 0 through 5
    #[clap(long)]
    tags: Option<u8>,
    /// number of values to insert per row
    #[clap(long)]
    values: Option<NonZeroU16>,
    /// number of rows to insert
    #[clap(long)]
    rows: Option<u64>,
    /// number of rows to batch per write
    #[clap(long)]
    batch: Option<NonZeroU64>,
    /// measurement to insert to
    #[clap(long)]
    measurement: Option<String>,
    /// maximum number of writes in flight
    #[clap(long)]
    concurrency: Option<NonZeroUsize>,
    /// stop writing after the first failed batch
    #[clap(long)]
    fail_fast: bool,
    /// milliseconds to wait after creating the database
    #[clap(long)]
    settle_millis: Option<u64>,
    /// seconds before an HTTP request is abandoned
    #[clap(long)]
    request_timeout_secs: Option<NonZeroU64>,
    /// seed for point generation, random if absent
    #[clap(long)]
    seed: Option<u64>,
    /// address to bind the prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

/// Rewrite single-dash long flags, `-rows 10` or `-rows=10`, to their
/// double-dash form. Arguments after a bare `--` are left alone.
fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let command = Args::command();
    let longs: Vec<&str> = command.get_arguments().filter_map(Arg::get_long).collect();

    let mut normalized = Vec::new();
    let mut flags_done = false;
    for arg in args {
        let arg: OsString = arg.into();
        if arg == "--" {
            flags_done = true;
        }
        let rewritten = match arg.to_str() {
            Some(flag) if !flags_done && flag.starts_with('-') && !flag.starts_with("--") => {
                let name = flag[1..].split('=').next().unwrap_or_default();
                longs.contains(&name).then(|| OsString::from(format!("-{flag}")))
            }
            _ => None,
        };
        normalized.push(rewritten.unwrap_or(arg));
    }
    normalized
}

/// Base configuration before flags are applied: `env_config`, the contents
/// of `INFLUX_LOAD_CONFIG`, if set, else the file at `--config-path`, else
/// the defaults.
fn base_config(args: &Args, env_config: Option<String>) -> Result<Config, Error> {
    if let Some(env_var_value) = env_config {
        debug!("Using config from env var '{CONFIG_ENV}'");
        return Ok(Config::from_yaml(&env_var_value)?);
    }
    let Some(path) = &args.config_path else {
        return Ok(Config::default());
    };
    debug!("Attempting to open configuration file at: {}", path.display());
    Config::load(path).map_err(|err| {
        error!("Could not load config file '{}': {}", path.display(), err);
        Error::Config(err)
    })
}

fn get_config(args: Args, mut config: Config) -> Result<Config, Error> {
    if let Some(database) = args.database {
        config.database = database;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(username) = args.username {
        config.username = Some(username);
    }
    if let Some(password) = args.password {
        config.password = Some(Password::new(password));
    }
    if let Some(tags) = args.tags {
        config.tags = tags;
    }
    if let Some(values) = args.values {
        config.values = values;
    }
    if let Some(rows) = args.rows {
        config.rows = rows;
    }
    if let Some(batch) = args.batch {
        config.batch = batch;
    }
    if let Some(measurement) = args.measurement {
        config.measurement = measurement;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.fail_fast |= args.fail_fast;
    if let Some(settle_millis) = args.settle_millis {
        config.settle_millis = settle_millis;
    }
    if let Some(request_timeout_secs) = args.request_timeout_secs {
        config.request_timeout_secs = request_timeout_secs;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.prometheus_addr.is_some() {
        config.prometheus_addr = args.prometheus_addr;
    }

    config.validate()?;
    Ok(config)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(addr) = config.prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Serving prometheus metrics on {addr}");
    }

    let shutdown = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Could not listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c");
    };

    let report = load::run(config, shutdown).await?;
    if report.interrupted {
        info!(
            "Run interrupted after {} of the configured rows",
            report.points_written
        );
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting influx_load {version} run.");

    let args = Args::parse_from(normalize_flags(env::args_os()));
    let base = base_config(&args, env::var(CONFIG_ENV).ok())?;
    let config = get_config(args, base)?;
    info!("{config:#?}");

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    runtime.shutdown_timeout(Duration::from_secs(5));
    match &res {
        Ok(()) => info!("Bye. :)"),
        Err(err) => error!("{err}"),
    }
    res
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn flags_use_defaults() {
        let args = Args::parse_from(["influx_load"]);
        let config = get_config(args, Config::default()).expect("default config is valid");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "influx_load",
            "--database",
            "bench",
            "--host",
            "http://influx:8086",
            "--tags",
            "5",
            "--values",
            "3",
            "--rows",
            "100000",
            "--batch",
            "5000",
            "--fail-fast",
        ]);
        let config = get_config(args, Config::default()).expect("config is valid");
        assert_eq!(config.database, "bench");
        assert_eq!(config.host, "http://influx:8086");
        assert_eq!(config.tags, 5);
        assert_eq!(config.values.get(), 3);
        assert_eq!(config.rows, 100_000);
        assert_eq!(config.batch.get(), 5_000);
        assert!(config.fail_fast);
    }

    #[test]
    fn flags_override_file() {
        let contents = r#"
database: "from_file"
rows: 50
seed: 3
"#;
        let args = Args::parse_from(["influx_load", "--rows", "75"]);
        let base = Config::from_yaml(contents).expect("valid yaml");
        let config = get_config(args, base).expect("config is valid");
        assert_eq!(config.database, "from_file");
        assert_eq!(config.rows, 75);
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn zero_batch_flag_is_rejected() {
        assert!(Args::try_parse_from(["influx_load", "--batch", "0"]).is_err());
    }

    #[test]
    fn too_many_tags_is_rejected() {
        let args = Args::parse_from(["influx_load", "--tags", "6"]);
        assert!(matches!(
            get_config(args, Config::default()),
            Err(Error::Config(config::Error::TooManyTags { .. }))
        ));
    }

    #[test]
    fn config_path_is_read() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file could not be created");
        writeln!(file, "measurement: cpu").expect("write failed");
        let path = file.path().to_str().expect("utf-8 path");
        let args = Args::parse_from(["influx_load", "--config-path", path, "--tags", "2"]);
        let base = base_config(&args, None).expect("config file is valid");
        let config = get_config(args, base).expect("config is valid");
        assert_eq!(config.measurement, "cpu");
        assert_eq!(config.tags, 2);
    }

    #[test]
    fn missing_config_path_is_an_error() {
        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("absent.yaml");
        let path = path.to_str().expect("utf-8 path");
        let args = Args::parse_from(["influx_load", "--config-path", path]);
        assert!(matches!(
            base_config(&args, None),
            Err(Error::Config(config::Error::ReadFile { .. }))
        ));
    }

    #[test]
    fn single_dash_long_flags_parse() {
        let args = Args::try_parse_from(normalize_flags([
            "influx_load",
            "-rows",
            "10",
            "-batch=5",
            "-fail-fast",
            "--tags",
            "2",
        ]))
        .expect("single-dash flags parse");
        let config = get_config(args, Config::default()).expect("config is valid");
        assert_eq!(config.rows, 10);
        assert_eq!(config.batch.get(), 5);
        assert_eq!(config.tags, 2);
        assert!(config.fail_fast);
    }

    #[test]
    fn normalize_rewrites_only_known_flags_before_separator() {
        let normalized = normalize_flags([
            "influx_load",
            "-nope",
            "--database",
            "-rows",
            "--",
            "-host",
        ]);
        assert_eq!(
            normalized,
            ["influx_load", "-nope", "--database", "--rows", "--", "-host"]
                .map(OsString::from)
                .to_vec()
        );
    }

    #[test]
    fn env_config_takes_precedence_over_config_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file could not be created");
        writeln!(file, "measurement: from_file").expect("write failed");
        let path = file.path().to_str().expect("utf-8 path");
        let args = Args::parse_from(["influx_load", "--config-path", path]);
        let base = base_config(&args, Some("measurement: from_env\n".to_string()))
            .expect("env config is valid");
        assert_eq!(base.measurement, "from_env");
    }
}
