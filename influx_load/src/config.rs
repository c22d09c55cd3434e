//! Run configuration as supplied by the user.
//!
//! Problems with the configuration are reported here, as typed errors, before
//! any request is sent to the server.
//!
//! Configuration comes from an optional YAML document; command line flags
//! are layered on top by the binary. Every field has a default so an empty
//! document is a valid configuration.
use std::{
    fmt, io,
    net::SocketAddr,
    num::{NonZeroU16, NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use influx_load_payload::TagName;
use serde::{Deserialize, Serialize};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// More tags requested than exist
    #[error("tags must be between 0 and {available}, got {requested}")]
    TooManyTags {
        /// Number of tags requested
        requested: u8,
        /// Size of the tag vocabulary
        available: usize,
    },
    /// Field value range is empty or not finite
    #[error("value range [{min}, {max}) is empty, not finite or too wide")]
    InvalidValueRange {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// Database name is empty
    #[error("database name must not be empty")]
    EmptyDatabase,
    /// Measurement name is empty
    #[error("measurement name must not be empty")]
    EmptyMeasurement,
}

/// A password that does not show up in logs.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Create a new [`Password`]
    #[must_use]
    pub fn new(inner: impl Into<String>) -> Self {
        Self(inner.into())
    }

    /// The cleartext password
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"********\"")
    }
}

/// Default value for [`Config::database`]
#[must_use]
pub fn default_database() -> String {
    "test_load_database".to_string()
}

/// Default value for [`Config::host`]
#[must_use]
pub fn default_host() -> String {
    "http://localhost:8086".to_string()
}

fn default_values() -> NonZeroU16 {
    NonZeroU16::MIN
}

fn default_rows() -> u64 {
    1
}

fn default_batch() -> NonZeroU64 {
    NonZeroU64::MIN
}

fn default_measurement() -> String {
    "p1".to_string()
}

fn default_value_min() -> f64 {
    0.0
}

fn default_value_max() -> f64 {
    1_000.0
}

/// Default value for [`Config::concurrency`], the number of available CPUs.
#[must_use]
pub fn default_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
}

fn default_settle_millis() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> NonZeroU64 {
    NonZeroU64::new(30).unwrap_or(NonZeroU64::MIN)
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The database to write into, created if absent
    #[serde(default = "default_database")]
    pub database: String,
    /// Base URI of the InfluxDB HTTP API
    #[serde(default = "default_host")]
    pub host: String,
    /// User to authenticate as
    #[serde(default)]
    pub username: Option<String>,
    /// Password for `username`
    #[serde(default)]
    pub password: Option<Password>,
    /// Number of tags per point, a prefix of region, row, rack, slot, host
    #[serde(default)]
    pub tags: u8,
    /// Number of float fields per point
    #[serde(default = "default_values")]
    pub values: NonZeroU16,
    /// Total number of points to write
    #[serde(default = "default_rows")]
    pub rows: u64,
    /// Number of points per write
    #[serde(default = "default_batch")]
    pub batch: NonZeroU64,
    /// The measurement points are written to
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Lower bound of field values, inclusive
    #[serde(default = "default_value_min")]
    pub value_min: f64,
    /// Upper bound of field values, exclusive
    #[serde(default = "default_value_max")]
    pub value_max: f64,
    /// Maximum number of writes in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: NonZeroUsize,
    /// Stop dispatching batches after the first failed write
    #[serde(default)]
    pub fail_fast: bool,
    /// Pause between database creation and the first write
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    /// Deadline for each HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: NonZeroU64,
    /// Seed for point generation, random when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Address to expose prometheus metrics on
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            host: default_host(),
            username: None,
            password: None,
            tags: 0,
            values: default_values(),
            rows: default_rows(),
            batch: default_batch(),
            measurement: default_measurement(),
            value_min: default_value_min(),
            value_max: default_value_max(),
            concurrency: default_concurrency(),
            fail_fast: false,
            settle_millis: default_settle_millis(),
            request_timeout_secs: default_request_timeout_secs(),
            seed: None,
            prometheus_addr: None,
        }
    }
}

impl Config {
    /// Parse a [`Config`] from YAML. An empty document yields the defaults.
    ///
    /// # Errors
    ///
    /// Function will return an error if the document is not valid YAML or
    /// holds unknown or mistyped fields.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Function will return an error naming the first violated constraint.
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.is_empty() {
            return Err(Error::EmptyDatabase);
        }
        if self.measurement.is_empty() {
            return Err(Error::EmptyMeasurement);
        }
        if usize::from(self.tags) > TagName::ALL.len() {
            return Err(Error::TooManyTags {
                requested: self.tags,
                available: TagName::ALL.len(),
            });
        }
        if !(self.value_min.is_finite()
            && self.value_max.is_finite()
            && self.value_min < self.value_max
            && (self.value_max - self.value_min).is_finite())
        {
            return Err(Error::InvalidValueRange {
                min: self.value_min,
                max: self.value_max,
            });
        }
        Ok(())
    }

    /// Pause between database creation and the first write.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    /// Deadline for each HTTP request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.get())
    }
}
