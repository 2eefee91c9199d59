// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in argument generators.

use crate::errors::GeneratorError;
use camino::{Utf8Path, Utf8PathBuf};
use gauntlet_metadata::Value;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fmt;
use walkdir::WalkDir;

/// A deterministic, finite source of argument values.
///
/// Each row assigns [`width`](Self::width) values, one per key the generator
/// is registered for. A generator is enumerated once per argument space; if
/// it declares a [`cache_key`](Self::cache_key), its rows are also shared
/// across batches through the harness context.
pub trait Generator: fmt::Debug + Send + Sync {
    /// The number of values in each row.
    fn width(&self) -> usize {
        1
    }

    /// Produces every row, in order.
    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError>;

    /// A key under which the output may be memoized across batches.
    fn cache_key(&self) -> Option<String> {
        None
    }
}

/// A fixed list of values.
#[derive(Clone, Debug)]
pub struct ValuesGenerator {
    values: Vec<Value>,
}

impl ValuesGenerator {
    /// Creates a generator over `values`.
    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl Generator for ValuesGenerator {
    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        Ok(self.values.iter().map(|v| vec![v.clone()]).collect())
    }
}

/// Integers from `start` (inclusive) to `end` (exclusive), `step` apart.
#[derive(Clone, Copy, Debug)]
pub struct RangeGenerator {
    start: i64,
    end: i64,
    step: i64,
}

impl RangeGenerator {
    /// Creates a generator over `start..end` with a step of 1.
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            step: 1,
        }
    }

    /// Sets the step. Non-positive steps produce no values.
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }
}

impl Generator for RangeGenerator {
    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        if self.step <= 0 {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        let mut current = self.start;
        while current < self.end {
            rows.push(vec![Value::Int(current)]);
            match current.checked_add(self.step) {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(rows)
    }
}

/// Files under a directory matching a set of glob patterns.
///
/// Patterns are matched against paths relative to the root. Files are
/// produced as absolute text values, sorted by path.
#[derive(Clone, Debug)]
pub struct FileGenerator {
    root: Utf8PathBuf,
    patterns: Vec<String>,
}

impl FileGenerator {
    /// Creates a generator for files under `root` matching any of `patterns`.
    pub fn new<I, S>(root: impl Into<Utf8PathBuf>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    fn glob_set(&self) -> Result<GlobSet, GeneratorError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(builder.build()?)
    }
}

impl Generator for FileGenerator {
    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        let globs = self.glob_set()?;
        let mut rows = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|error| GeneratorError::Walk {
                root: self.root.clone(),
                error,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| GeneratorError::NonUtf8Path(entry.path().to_owned()))?;
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if globs.is_match(relative.as_std_path()) {
                rows.push(vec![Value::Text(path.to_string())]);
            }
        }
        Ok(rows)
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("files:{}:{}", self.root, self.patterns.join(",")))
    }
}

/// The entries of a playlist file.
///
/// One entry per line; blank lines and lines starting with `#` are skipped.
/// Relative entries are resolved against the playlist's directory.
#[derive(Clone, Debug)]
pub struct PlaylistGenerator {
    path: Utf8PathBuf,
}

impl PlaylistGenerator {
    /// Creates a generator reading `path`.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Generator for PlaylistGenerator {
    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        let contents =
            std::fs::read_to_string(&self.path).map_err(|error| GeneratorError::Read {
                path: self.path.clone(),
                error,
            })?;
        let base = self.path.parent().unwrap_or_else(|| Utf8Path::new(""));
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                let entry = Utf8Path::new(line);
                let resolved = if entry.is_absolute() || line.contains("://") {
                    line.to_owned()
                } else {
                    base.join(entry).into_string()
                };
                vec![Value::Text(resolved)]
            })
            .collect())
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("playlist:{}", self.path))
    }
}

/// Fixed rows that assign several keys at once, such as compatible element
/// combinations.
#[derive(Clone, Debug)]
pub struct TupleGenerator {
    width: usize,
    rows: Vec<Vec<Value>>,
}

impl TupleGenerator {
    /// Creates a generator producing `rows`, each of which must have `width`
    /// values.
    pub fn new(width: usize, rows: Vec<Vec<Value>>) -> Self {
        Self { width, rows }
    }
}

impl Generator for TupleGenerator {
    fn width(&self) -> usize {
        self.width
    }

    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        for (row, values) in self.rows.iter().enumerate() {
            if values.len() != self.width {
                return Err(GeneratorError::RowWidth {
                    row,
                    expected: self.width,
                    found: values.len(),
                });
            }
        }
        Ok(self.rows.clone())
    }
}

/// Several generators of equal length advanced in lockstep.
///
/// Row `i` is the concatenation of row `i` of every inner generator.
#[derive(Debug)]
pub struct ZipGenerator {
    inner: Vec<Box<dyn Generator>>,
}

impl ZipGenerator {
    /// Creates a generator zipping `inner`.
    pub fn new(inner: Vec<Box<dyn Generator>>) -> Self {
        Self { inner }
    }
}

impl Generator for ZipGenerator {
    fn width(&self) -> usize {
        self.inner.iter().map(|g| g.width()).sum()
    }

    fn generate(&self) -> Result<Vec<Vec<Value>>, GeneratorError> {
        let mut columns = self
            .inner
            .iter()
            .map(|g| g.generate())
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = columns.first().map(Vec::len) else {
            return Ok(Vec::new());
        };
        if let Some(other) = columns.iter().map(Vec::len).find(|len| *len != first) {
            return Err(GeneratorError::ZipLength { first, other });
        }

        let mut rows = vec![Vec::with_capacity(self.width()); first];
        for column in &mut columns {
            for (row, values) in rows.iter_mut().zip(column.drain(..)) {
                row.extend(values);
            }
        }
        Ok(rows)
    }

    fn cache_key(&self) -> Option<String> {
        let keys = self
            .inner
            .iter()
            .map(|g| g.cache_key())
            .collect::<Option<Vec<_>>>()?;
        Some(format!("zip:[{}]", keys.join(";")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn flat(rows: Vec<Vec<Value>>) -> Vec<Value> {
        rows.into_iter().flatten().collect()
    }

    #[test_case(RangeGenerator::new(0, 3), vec![0, 1, 2]; "simple")]
    #[test_case(RangeGenerator::new(0, 10).with_step(4), vec![0, 4, 8]; "stepped")]
    #[test_case(RangeGenerator::new(5, 5), vec![]; "empty")]
    #[test_case(RangeGenerator::new(0, 5).with_step(0), vec![]; "zero step")]
    fn range(generator: RangeGenerator, expected: Vec<i64>) {
        let values = flat(generator.generate().unwrap());
        assert_eq!(values, expected.into_iter().map(Value::Int).collect::<Vec<_>>());
    }

    #[test]
    fn files_are_sorted_and_filtered() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        for name in ["b.ogg", "a.ogg", "notes.txt", "sub/c.ogg"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let generator = FileGenerator::new(dir.path(), ["**/*.ogg"]);
        let values = flat(generator.generate().unwrap());
        let expected: Vec<_> = ["a.ogg", "b.ogg", "sub/c.ogg"]
            .into_iter()
            .map(|name| Value::Text(dir.path().join(name).into_string()))
            .collect();
        assert_eq!(values, expected);
        assert!(generator.cache_key().is_some());
    }

    #[test]
    fn bad_glob() {
        let generator = FileGenerator::new("/nonexistent", ["a[b"]);
        assert!(matches!(
            generator.generate(),
            Err(GeneratorError::Glob(_))
        ));
    }

    #[test]
    fn playlist_entries() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("list.m3u");
        std::fs::write(
            &path,
            indoc! {"
                # A playlist
                clip.ogg

                /media/abs.ogg
                http://example.com/stream.ogg
            "},
        )
        .unwrap();

        let values = flat(PlaylistGenerator::new(&path).generate().unwrap());
        assert_eq!(
            values,
            vec![
                Value::Text(dir.path().join("clip.ogg").into_string()),
                Value::from("/media/abs.ogg"),
                Value::from("http://example.com/stream.ogg"),
            ]
        );
    }

    #[test]
    fn missing_playlist() {
        let error = PlaylistGenerator::new("/nonexistent/list.m3u")
            .generate()
            .unwrap_err();
        assert!(matches!(error, GeneratorError::Read { .. }), "{error}");
    }

    #[test]
    fn tuple_rows_are_checked() {
        let generator = TupleGenerator::new(
            2,
            vec![vec![Value::from("a"), Value::from(1)], vec![Value::from("b")]],
        );
        assert!(matches!(
            generator.generate(),
            Err(GeneratorError::RowWidth { row: 1, expected: 2, found: 1 })
        ));
    }

    #[test]
    fn zip_in_lockstep() {
        let generator = ZipGenerator::new(vec![
            Box::new(ValuesGenerator::new(["x", "y"])),
            Box::new(RangeGenerator::new(0, 2)),
        ]);
        assert_eq!(generator.width(), 2);
        assert_eq!(
            generator.generate().unwrap(),
            vec![
                vec![Value::from("x"), Value::Int(0)],
                vec![Value::from("y"), Value::Int(1)],
            ]
        );
        // Value lists are not cacheable, so neither is the zip.
        assert_eq!(generator.cache_key(), None);

        let mismatched = ZipGenerator::new(vec![
            Box::new(ValuesGenerator::new(["x"])),
            Box::new(RangeGenerator::new(0, 2)),
        ]);
        assert!(matches!(
            mismatched.generate(),
            Err(GeneratorError::ZipLength { first: 1, other: 2 })
        ));
    }
}
