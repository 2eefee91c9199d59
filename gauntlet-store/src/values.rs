// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use gauntlet_metadata::Value;
use rusqlite::Row;

/// The `(intvalue, txtvalue, blobvalue)` columns for a value. Exactly one is
/// non-null.
pub(crate) fn to_columns(value: &Value) -> (Option<i64>, Option<&str>, Option<&[u8]>) {
    match value {
        Value::Int(v) => (Some(*v), None, None),
        Value::Text(v) => (None, Some(v.as_str()), None),
        Value::Blob(v) => (None, None, Some(v.as_slice())),
    }
}

/// Reads a value from three consecutive columns starting at `first`.
///
/// Rows with all three columns null come back as empty text.
pub(crate) fn from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Value> {
    if let Some(v) = row.get::<_, Option<i64>>(first)? {
        return Ok(Value::Int(v));
    }
    if let Some(v) = row.get::<_, Option<String>>(first + 1)? {
        return Ok(Value::Text(v));
    }
    let blob = row.get::<_, Option<Vec<u8>>>(first + 2)?;
    Ok(blob.map_or_else(|| Value::Text(String::new()), Value::Blob))
}
