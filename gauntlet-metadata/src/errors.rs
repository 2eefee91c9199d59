// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the data model.

use crate::{DictKind, Value};
use thiserror::Error;

/// A name was used that the schema of a test or monitor does not declare.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("`{name}` is not a declared {dict} field of `{class}`")]
pub struct UndeclaredFieldError {
    /// The class whose schema was consulted.
    pub class: String,

    /// The dictionary that was consulted.
    pub dict: DictKind,

    /// The offending name.
    pub name: String,
}

/// An argument value had the wrong type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("argument `{name}` expected a {expected} value, found {}", .found.kind())]
pub struct ArgumentTypeError {
    /// The argument name.
    pub name: String,

    /// The expected value kind.
    pub expected: &'static str,

    /// The value that was found.
    pub found: Value,
}
