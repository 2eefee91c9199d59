// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Argument spaces.
//!
//! An [`Arguments`] is a declarative set of static values and generators. It is
//! expanded once into an [`ArgumentSpace`], whose tuples are the Cartesian
//! product of the generator rows merged with the static values. Tuples are
//! produced lazily in a fixed odometer order:
//!
//! * axes are ordered by their first key;
//! * the first axis is the least significant one, advancing on every step;
//! * the next axis advances only when the previous one wraps around.

mod generators;

pub use generators::*;

use crate::{context::GeneratorCache, errors::ArgumentsError};
use gauntlet_metadata::{ArgumentValues, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use tracing::debug;

/// A declarative argument set: static values plus generators.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    statics: ArgumentValues,
    generators: Vec<(Vec<String>, Arc<dyn Generator>)>,
}

impl Arguments {
    /// Creates an empty argument set, which expands to a single empty tuple.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `value` to `key` in every tuple.
    pub fn with_static(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.statics.insert(key.into(), value.into());
        self
    }

    /// Assigns each value of a single-width `generator` to `key`.
    pub fn with_generator(self, key: impl Into<String>, generator: impl Generator + 'static) -> Self {
        self.with_tuple_generator([key.into()], generator)
    }

    /// Assigns each row of `generator` to `keys`, position by position.
    pub fn with_tuple_generator<I, S>(
        mut self,
        keys: I,
        generator: impl Generator + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        self.generators.push((keys, Arc::new(generator)));
        self
    }

    /// Every argument name this set assigns.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.statics
            .keys()
            .map(String::as_str)
            .chain(
                self.generators
                    .iter()
                    .flat_map(|(keys, _)| keys.iter().map(String::as_str)),
            )
            .collect()
    }

    /// Enumerates every generator once and returns the resulting space.
    ///
    /// Generators with a cache key are looked up in (and added to) `cache`.
    pub fn expand(&self, cache: &GeneratorCache) -> Result<ArgumentSpace, ArgumentsError> {
        let mut seen: BTreeSet<&str> = self.statics.keys().map(String::as_str).collect();
        let mut axes = BTreeMap::new();

        for (keys, generator) in &self.generators {
            for key in keys {
                if !seen.insert(key) {
                    return Err(ArgumentsError::DuplicateKey(key.clone()));
                }
            }
            let (Some(first), true) = (keys.first(), generator.width() == keys.len()) else {
                return Err(ArgumentsError::WidthMismatch {
                    keys: keys.clone(),
                    width: generator.width(),
                });
            };

            let generate = || generator.generate();
            let rows = match generator.cache_key() {
                Some(cache_key) => cache.get_or_try_insert(&cache_key, generate),
                None => generate().map(Into::into),
            }
            .map_err(|error| ArgumentsError::Generator {
                keys: keys.clone(),
                error,
            })?;
            debug!(?keys, len = rows.len(), "expanded generator");

            axes.insert(
                first.clone(),
                Axis {
                    keys: keys.clone(),
                    rows,
                },
            );
        }

        Ok(ArgumentSpace {
            statics: self.statics.clone(),
            axes: axes.into_values().collect(),
        })
    }
}

#[derive(Clone, Debug)]
struct Axis {
    keys: Vec<String>,
    rows: Arc<[Vec<Value>]>,
}

/// An expanded argument space with a known length.
#[derive(Clone, Debug)]
pub struct ArgumentSpace {
    statics: ArgumentValues,
    axes: Vec<Axis>,
}

impl ArgumentSpace {
    /// The number of tuples: the product of every generator's length.
    pub fn len(&self) -> usize {
        self.axes
            .iter()
            .map(|axis| axis.rows.len())
            .try_fold(1usize, usize::checked_mul)
            .unwrap_or(usize::MAX)
    }

    /// Returns true if the space has no tuples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every argument name assigned by tuples of this space.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.statics
            .keys()
            .chain(self.axes.iter().flat_map(|axis| axis.keys.iter()))
            .map(String::as_str)
    }

    /// Returns the tuple at odometer position `index`.
    pub fn get(&self, index: usize) -> Option<ArgumentValues> {
        if index >= self.len() {
            return None;
        }
        let mut remainder = index;
        let positions: Vec<usize> = self
            .axes
            .iter()
            .map(|axis| {
                let len = axis.rows.len();
                let position = remainder % len;
                remainder /= len;
                position
            })
            .collect();
        Some(self.tuple(&positions))
    }

    /// Iterates over the space from the start.
    pub fn iter(self: &Arc<Self>) -> ArgumentsIter {
        self.iter_from(0)
    }

    /// Iterates over the space starting at odometer position `start`.
    pub fn iter_from(self: &Arc<Self>, start: usize) -> ArgumentsIter {
        let len = self.len();
        let mut remainder = start;
        let odometer = self
            .axes
            .iter()
            .map(|axis| {
                let modulus = axis.rows.len();
                let index = if modulus == 0 { 0 } else { remainder % modulus };
                remainder = remainder.checked_div(modulus).unwrap_or(0);
                OdometerDigit { index, modulus }
            })
            .collect();
        ArgumentsIter {
            space: self.clone(),
            odometer,
            position: start.min(len),
            exhausted: start >= len,
        }
    }

    fn tuple(&self, positions: &[usize]) -> ArgumentValues {
        let mut tuple = self.statics.clone();
        for (axis, &position) in self.axes.iter().zip(positions) {
            for (key, value) in axis.keys.iter().zip(&axis.rows[position]) {
                tuple.insert(key.clone(), value.clone());
            }
        }
        tuple
    }
}

#[derive(Clone, Copy, Debug)]
struct OdometerDigit {
    index: usize,
    modulus: usize,
}

/// A resumable iterator over an [`ArgumentSpace`].
///
/// Once every tuple has been produced the iterator keeps returning `None`.
#[derive(Clone)]
pub struct ArgumentsIter {
    space: Arc<ArgumentSpace>,
    odometer: Vec<OdometerDigit>,
    position: usize,
    exhausted: bool,
}

impl ArgumentsIter {
    /// The number of tuples produced so far, counting from the start of the
    /// space. Passing this to [`ArgumentSpace::iter_from`] resumes the sweep.
    pub fn position(&self) -> usize {
        self.position
    }

    fn advance(&mut self) {
        for digit in &mut self.odometer {
            digit.index += 1;
            if digit.index < digit.modulus {
                return;
            }
            digit.index = 0;
        }
        // Every digit wrapped around.
        self.exhausted = true;
    }
}

impl Iterator for ArgumentsIter {
    type Item = ArgumentValues;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let positions: Vec<usize> = self.odometer.iter().map(|digit| digit.index).collect();
        let tuple = self.space.tuple(&positions);
        self.position += 1;
        self.advance();
        Some(tuple)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.exhausted {
            0
        } else {
            self.space.len() - self.position
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ArgumentsIter {}

impl std::iter::FusedIterator for ArgumentsIter {}

impl fmt::Debug for ArgumentsIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentsIter")
            .field("position", &self.position)
            .field("len", &self.space.len())
            .finish()
    }
}
