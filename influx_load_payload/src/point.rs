//! Synthetic data points.
//!
//! A [`Point`] is one sample of a measurement: a timestamp, a set of tags
//! drawn from a fixed vocabulary and one or more float fields. Points are
//! produced by [`Generator`] from a caller supplied source of randomness so
//! that runs are reproducible from a seed.

use std::{
    fmt,
    ops::Range,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;

use crate::Error;

const REGIONS: [&str; 4] = ["uswest", "useast", "europe", "asia"];
const ROWS: u32 = 25;
const RACKS: u32 = 50;
const SLOTS: u32 = 100;
const HOSTS: u32 = 1_000;

/// The names of tags a [`Point`] may carry.
///
/// The vocabulary is closed and ordered. Callers ask for a number of tags and
/// receive that prefix of [`TagName::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagName {
    /// Datacenter region, one of a handful of names
    Region,
    /// Row within the datacenter
    Row,
    /// Rack within the row
    Rack,
    /// Slot within the rack
    Slot,
    /// Host name, `server<n>`
    Host,
}

impl TagName {
    /// Every tag name, in prefix order.
    pub const ALL: [TagName; 5] = [
        TagName::Region,
        TagName::Row,
        TagName::Rack,
        TagName::Slot,
        TagName::Host,
    ];

    /// Return the first `count` tag names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyTags`] if `count` exceeds the vocabulary.
    pub fn prefix(count: usize) -> Result<&'static [TagName], Error> {
        Self::ALL.get(..count).ok_or(Error::TooManyTags {
            requested: count,
            available: Self::ALL.len(),
        })
    }

    /// The tag key as written on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TagName::Region => "region",
            TagName::Row => "row",
            TagName::Rack => "rack",
            TagName::Slot => "slot",
            TagName::Host => "host",
        }
    }

    /// Number of distinct values this tag takes.
    #[must_use]
    pub fn cardinality(self) -> u64 {
        match self {
            TagName::Region => REGIONS.len() as u64,
            TagName::Row => u64::from(ROWS),
            TagName::Rack => u64::from(RACKS),
            TagName::Slot => u64::from(SLOTS),
            TagName::Host => u64::from(HOSTS),
        }
    }

    fn sample<R>(self, rng: &mut R) -> String
    where
        R: Rng + ?Sized,
    {
        match self {
            TagName::Region => REGIONS[rng.random_range(0..REGIONS.len())].to_string(),
            TagName::Row => rng.random_range(0..ROWS).to_string(),
            TagName::Rack => rng.random_range(0..RACKS).to_string(),
            TagName::Slot => rng.random_range(0..SLOTS).to_string(),
            TagName::Host => format!("server{}", rng.random_range(0..HOSTS)),
        }
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tag, key and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// The tag key
    pub name: TagName,
    /// The tag value
    pub value: String,
}

/// A single float field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field<'a> {
    /// The field key
    pub name: &'a str,
    /// The field value
    pub value: f64,
}

/// One measurement sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Point<'a> {
    /// Measurement name
    pub measurement: &'a str,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// Tags, one per requested tag name, in [`TagName::ALL`] order
    pub tags: Vec<Tag>,
    /// Field values, `v1` onward
    pub fields: Vec<Field<'a>>,
}

/// Source of point timestamps.
pub trait Clock {
    /// Nanoseconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// [`Clock`] backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }
}

/// Produces [`Point`] instances of a fixed shape.
#[derive(Debug, Clone)]
pub struct Generator {
    measurement: String,
    tags: &'static [TagName],
    fields: Vec<String>,
    range: Range<f64>,
}

impl Generator {
    /// Create a new [`Generator`].
    ///
    /// Points will carry the first `tags` names of [`TagName::ALL`] and
    /// `fields` float fields named `v1..=v<fields>`, each sampled uniformly
    /// from `range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the measurement is empty, `tags` exceeds the
    /// vocabulary, `fields` is zero or `range` is empty, not finite or wider
    /// than an `f64` can hold.
    pub fn new(
        measurement: impl Into<String>,
        tags: usize,
        fields: usize,
        range: Range<f64>,
    ) -> Result<Self, Error> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(Error::EmptyMeasurement);
        }
        if fields == 0 {
            return Err(Error::NoFields);
        }
        if !(range.start.is_finite()
            && range.end.is_finite()
            && range.start < range.end
            && (range.end - range.start).is_finite())
        {
            return Err(Error::InvalidRange {
                min: range.start,
                max: range.end,
            });
        }

        Ok(Self {
            measurement,
            tags: TagName::prefix(tags)?,
            fields: (1..=fields).map(|i| format!("v{i}")).collect(),
            range,
        })
    }

    /// The tag names every generated point carries.
    #[must_use]
    pub fn tag_names(&self) -> &'static [TagName] {
        self.tags
    }

    /// Upper bound on the number of distinct series this generator writes.
    #[must_use]
    pub fn series_cardinality(&self) -> u64 {
        self.tags
            .iter()
            .map(|t| t.cardinality())
            .fold(1, u64::saturating_mul)
    }

    /// Generate a new [`Point`] stamped with `timestamp`.
    pub fn generate<R>(&self, rng: &mut R, timestamp: i64) -> Point<'_>
    where
        R: Rng + ?Sized,
    {
        let tags = self
            .tags
            .iter()
            .map(|&name| Tag {
                name,
                value: name.sample(rng),
            })
            .collect();
        let fields = self
            .fields
            .iter()
            .map(|name| Field {
                name: name.as_str(),
                value: rng.random_range(self.range.clone()),
            })
            .collect();

        Point {
            measurement: &self.measurement,
            timestamp,
            tags,
            fields,
        }
    }
}
