//! Group generated points into write batches.
//!
//! A run writes `rows` points in batches of `batch_size`. Every batch is full
//! except possibly the last, which carries the remainder. Batches are built
//! on demand so that a run never holds more encoded points in memory than the
//! caller keeps in flight.

use std::num::NonZeroU64;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::{Clock, Error, Generator, line_protocol};

/// A group of points encoded as line protocol, ready for one write call.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in the run, starting at 1
    pub index: u64,
    /// Number of points encoded in `bytes`
    pub points: u64,
    /// The line protocol body
    pub bytes: Bytes,
}

/// Iterator over the [`Batch`] instances of a run.
#[derive(Debug)]
pub struct Batches<R, C> {
    generator: Generator,
    rng: R,
    clock: C,
    remaining: u64,
    batch_size: NonZeroU64,
    index: u64,
}

impl<R, C> Batches<R, C>
where
    R: Rng,
    C: Clock,
{
    /// Create a new [`Batches`] producing `rows` points in total.
    pub fn new(generator: Generator, rng: R, clock: C, rows: u64, batch_size: NonZeroU64) -> Self {
        Self {
            generator,
            rng,
            clock,
            remaining: rows,
            batch_size,
            index: 0,
        }
    }

    /// Number of batches `rows` points split into.
    #[must_use]
    pub fn total(rows: u64, batch_size: NonZeroU64) -> u64 {
        rows.div_ceil(batch_size.get())
    }
}

impl<R, C> Iterator for Batches<R, C>
where
    R: Rng,
    C: Clock,
{
    type Item = Result<Batch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let points = self.remaining.min(self.batch_size.get());
        self.remaining -= points;
        self.index += 1;

        let mut writer = BytesMut::new().writer();
        for _ in 0..points {
            let point = self.generator.generate(&mut self.rng, self.clock.now());
            if let Err(err) = line_protocol::encode(&point, &mut writer) {
                self.remaining = 0;
                return Some(Err(err));
            }
        }

        Some(Ok(Batch {
            index: self.index,
            points,
            bytes: writer.into_inner().freeze(),
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = Self::total(self.remaining, self.batch_size);
        match usize::try_from(left) {
            Ok(left) => (left, Some(left)),
            Err(_) => (usize::MAX, None),
        }
    }
}
