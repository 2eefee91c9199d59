// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test and monitor schemas.
//!
//! A [`Schema`] is declared statically next to the code implementing a test or
//! monitor kind. It lists the fields the kind adds and names its base schema
//! explicitly; the full set of fields is the union over the base chain and is
//! computed once with [`Schema::resolve`].
//!
//! [`ClassInfo`] is the owned, per-class (non-resolved) form of a schema, as
//! stored in and read back from a result database.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a schema describes a test or a monitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaKind {
    /// A test kind.
    Test,

    /// A monitor kind.
    Monitor,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Monitor => write!(f, "monitor"),
        }
    }
}

/// One of the four named dictionaries a schema declares.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DictKind {
    /// Accepted arguments.
    Arguments,

    /// Checks the kind may validate.
    Checklist,

    /// Extra information the kind may report.
    ExtraInfo,

    /// Output files the kind may produce.
    OutputFiles,
}

impl fmt::Display for DictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arguments => write!(f, "argument"),
            Self::Checklist => write!(f, "checklist"),
            Self::ExtraInfo => write!(f, "extra-info"),
            Self::OutputFiles => write!(f, "output-file"),
        }
    }
}

impl DictKind {
    /// All dictionary kinds, in storage order.
    pub const ALL: [DictKind; 4] = [
        DictKind::Arguments,
        DictKind::Checklist,
        DictKind::ExtraInfo,
        DictKind::OutputFiles,
    ];
}

/// A named field in a schema dictionary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Field {
    /// The field name.
    pub name: &'static str,

    /// A human-readable description.
    pub description: &'static str,
}

/// Shorthand for declaring a [`Field`] in a `static`.
pub const fn field(name: &'static str, description: &'static str) -> Field {
    Field { name, description }
}

/// The statically-declared shape of a test or monitor kind.
///
/// ```
/// use gauntlet_metadata::{field, Schema, SchemaKind, BASE_TEST_SCHEMA};
///
/// static PLAYBACK: Schema = Schema::new(SchemaKind::Test, "playback", "Plays a file")
///     .with_base(&BASE_TEST_SCHEMA)
///     .with_arguments(&[field("uri", "The location to play")])
///     .with_checklist(&[field("reached-eos", "Playback reached the end")]);
///
/// let resolved = PLAYBACK.resolve();
/// assert!(resolved.checklist().contains_key("test-started"));
/// assert!(resolved.checklist().contains_key("reached-eos"));
/// ```
#[derive(Debug)]
pub struct Schema {
    kind: SchemaKind,
    name: &'static str,
    description: &'static str,
    base: Option<&'static Schema>,
    arguments: &'static [Field],
    checklist: &'static [Field],
    extra_info: &'static [Field],
    output_files: &'static [Field],
}

impl Schema {
    /// Creates a root schema with no fields.
    pub const fn new(kind: SchemaKind, name: &'static str, description: &'static str) -> Self {
        Self {
            kind,
            name,
            description,
            base: None,
            arguments: &[],
            checklist: &[],
            extra_info: &[],
            output_files: &[],
        }
    }

    /// Sets the base schema.
    pub const fn with_base(mut self, base: &'static Schema) -> Self {
        self.base = Some(base);
        self
    }

    /// Sets the arguments this schema adds.
    pub const fn with_arguments(mut self, fields: &'static [Field]) -> Self {
        self.arguments = fields;
        self
    }

    /// Sets the checks this schema adds.
    pub const fn with_checklist(mut self, fields: &'static [Field]) -> Self {
        self.checklist = fields;
        self
    }

    /// Sets the extra-info keys this schema adds.
    pub const fn with_extra_info(mut self, fields: &'static [Field]) -> Self {
        self.extra_info = fields;
        self
    }

    /// Sets the output files this schema adds.
    pub const fn with_output_files(mut self, fields: &'static [Field]) -> Self {
        self.output_files = fields;
        self
    }

    /// Whether this is a test or monitor schema.
    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    /// The class name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// The base schema, if any.
    pub fn base(&self) -> Option<&'static Schema> {
        self.base
    }

    /// The fields this schema itself declares for `dict`.
    pub fn own_fields(&self, dict: DictKind) -> &'static [Field] {
        match dict {
            DictKind::Arguments => self.arguments,
            DictKind::Checklist => self.checklist,
            DictKind::ExtraInfo => self.extra_info,
            DictKind::OutputFiles => self.output_files,
        }
    }

    /// Iterates over this schema followed by its bases, most derived first.
    pub fn ancestry(&'static self) -> impl Iterator<Item = &'static Schema> {
        std::iter::successors(Some(self), |schema| schema.base)
    }

    /// Returns true if `self` is `other` or derives from it.
    pub fn is_a(&'static self, other: &Schema) -> bool {
        self.ancestry()
            .any(|schema| std::ptr::eq(schema, other) || schema.name == other.name)
    }

    /// Returns the owned class info for this schema alone.
    pub fn class_info(&self) -> ClassInfo {
        let to_map = |fields: &[Field]| {
            fields
                .iter()
                .map(|f| (f.name.to_owned(), f.description.to_owned()))
                .collect()
        };
        ClassInfo {
            kind: self.kind,
            name: self.name.to_owned(),
            parent: self.base.map(|base| base.name.to_owned()),
            description: self.description.to_owned(),
            arguments: to_map(self.arguments),
            checklist: to_map(self.checklist),
            extra_info: to_map(self.extra_info),
            output_files: to_map(self.output_files),
        }
    }

    /// Computes the union of this schema and all its bases.
    ///
    /// Fields declared closer to the root come first; a derived schema
    /// redeclaring a name replaces the description but keeps the position.
    pub fn resolve(&'static self) -> ResolvedSchema {
        let mut chain: Vec<&'static Schema> = self.ancestry().collect();
        chain.reverse();

        let mut resolved = ResolvedSchema {
            schema: self,
            arguments: IndexMap::new(),
            checklist: IndexMap::new(),
            extra_info: IndexMap::new(),
            output_files: IndexMap::new(),
        };
        for schema in chain {
            for dict in DictKind::ALL {
                let target = resolved.dict_mut(dict);
                for field in schema.own_fields(dict) {
                    target.insert(field.name, field.description);
                }
            }
        }
        resolved
    }
}

/// The union of a schema and all of its bases.
#[derive(Clone, Debug)]
pub struct ResolvedSchema {
    schema: &'static Schema,
    arguments: IndexMap<&'static str, &'static str>,
    checklist: IndexMap<&'static str, &'static str>,
    extra_info: IndexMap<&'static str, &'static str>,
    output_files: IndexMap<&'static str, &'static str>,
}

impl ResolvedSchema {
    /// The schema this was resolved from.
    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// The class name.
    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    /// All accepted arguments.
    pub fn arguments(&self) -> &IndexMap<&'static str, &'static str> {
        &self.arguments
    }

    /// The full checklist universe.
    pub fn checklist(&self) -> &IndexMap<&'static str, &'static str> {
        &self.checklist
    }

    /// All extra-info keys.
    pub fn extra_info(&self) -> &IndexMap<&'static str, &'static str> {
        &self.extra_info
    }

    /// All output-file slots.
    pub fn output_files(&self) -> &IndexMap<&'static str, &'static str> {
        &self.output_files
    }

    /// Returns the fields for `dict`.
    pub fn dict(&self, dict: DictKind) -> &IndexMap<&'static str, &'static str> {
        match dict {
            DictKind::Arguments => &self.arguments,
            DictKind::Checklist => &self.checklist,
            DictKind::ExtraInfo => &self.extra_info,
            DictKind::OutputFiles => &self.output_files,
        }
    }

    fn dict_mut(&mut self, dict: DictKind) -> &mut IndexMap<&'static str, &'static str> {
        match dict {
            DictKind::Arguments => &mut self.arguments,
            DictKind::Checklist => &mut self.checklist,
            DictKind::ExtraInfo => &mut self.extra_info,
            DictKind::OutputFiles => &mut self.output_files,
        }
    }
}

/// The owned description of a single test or monitor class, without its
/// bases' fields.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    /// Test or monitor.
    pub kind: SchemaKind,

    /// The class name.
    pub name: String,

    /// The name of the base class, if any.
    pub parent: Option<String>,

    /// A human-readable description.
    pub description: String,

    /// Arguments declared by this class.
    pub arguments: IndexMap<String, String>,

    /// Checks declared by this class.
    pub checklist: IndexMap<String, String>,

    /// Extra-info keys declared by this class.
    pub extra_info: IndexMap<String, String>,

    /// Output files declared by this class.
    pub output_files: IndexMap<String, String>,
}

impl ClassInfo {
    /// Returns the fields for `dict`.
    pub fn dict(&self, dict: DictKind) -> &IndexMap<String, String> {
        match dict {
            DictKind::Arguments => &self.arguments,
            DictKind::Checklist => &self.checklist,
            DictKind::ExtraInfo => &self.extra_info,
            DictKind::OutputFiles => &self.output_files,
        }
    }

    /// Returns the fields for `dict`, mutably.
    pub fn dict_mut(&mut self, dict: DictKind) -> &mut IndexMap<String, String> {
        match dict {
            DictKind::Arguments => &mut self.arguments,
            DictKind::Checklist => &mut self.checklist,
            DictKind::ExtraInfo => &mut self.extra_info,
            DictKind::OutputFiles => &mut self.output_files,
        }
    }
}

/// The root of every test schema.
pub static BASE_TEST_SCHEMA: Schema = Schema::new(SchemaKind::Test, "test", "Base test")
    .with_checklist(&[
        field("test-started", "The test started"),
        field("no-timeout", "The test did not time out"),
    ])
    .with_extra_info(&[
        field("test-setup-duration", "How long setup took (ms)"),
        field("test-total-duration", "How long the test took overall (ms)"),
        field("error-message", "Why the test stopped early, if it did"),
    ]);

/// The base schema of every scenario.
pub static SCENARIO_SCHEMA: Schema =
    Schema::new(SchemaKind::Test, "scenario", "A sequence of child tests")
        .with_base(&BASE_TEST_SCHEMA)
        .with_extra_info(&[field("subtest-count", "How many children were run")]);

/// The root of every monitor schema.
pub static BASE_MONITOR_SCHEMA: Schema =
    Schema::new(SchemaKind::Monitor, "monitor", "Base monitor");
