//! The influx-load payloads
//!
//! This library supports payload generation for the influx-load project:
//! synthetic points drawn from a fixed tag vocabulary, their encoding into
//! InfluxDB line protocol and the grouping of encoded points into batches.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::io;

pub mod batch;
pub mod line_protocol;
pub mod point;

pub use batch::{Batch, Batches};
pub use point::{Clock, Field, Generator, Point, SystemClock, Tag, TagName};

/// Errors related to point generation and serialization
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    /// More tags were requested than the vocabulary holds
    #[error("Requested {requested} tags but only {available} are available")]
    TooManyTags {
        /// Number of tags requested
        requested: usize,
        /// Size of the tag vocabulary
        available: usize,
    },
    /// At least one field per point is required
    #[error("Points must carry at least one field value")]
    NoFields,
    /// The field value range is empty or not finite
    #[error("Invalid value range [{min}, {max})")]
    InvalidRange {
        /// Lower bound, inclusive
        min: f64,
        /// Upper bound, exclusive
        max: f64,
    },
    /// A field value cannot be expressed in line protocol
    #[error("Field {field} holds non-finite value {value}")]
    NonFinite {
        /// Name of the offending field
        field: String,
        /// The offending value
        value: f64,
    },
    /// The measurement name is empty
    #[error("Measurement name must not be empty")]
    EmptyMeasurement,
}
