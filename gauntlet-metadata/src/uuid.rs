// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use newtype_uuid::{GenericUuid, TypedUuid, TypedUuidKind, TypedUuidTag};

/// The kind marker for [`TestUuid`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TestKind {}

impl TypedUuidKind for TestKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("test");
        TAG
    }
}

/// A globally unique identifier for a single test instance.
///
/// Test UUIDs are handed out by an allocator in the runner and are never
/// reused while an instance holding one is alive.
pub type TestUuid = TypedUuid<TestKind>;

/// The prefix of the well-known bus name a worker registers for a test.
pub const WORKER_NAME_PREFIX: &str = "net.gauntlet.worker.";

/// Returns the well-known bus name a worker registers for the given test.
pub fn worker_bus_name(uuid: TestUuid) -> String {
    format!("{WORKER_NAME_PREFIX}{}", uuid.into_untyped_uuid().simple())
}

/// Parses a well-known worker bus name back into a test UUID.
///
/// Returns `None` for names outside the worker naming convention.
pub fn parse_worker_bus_name(name: &str) -> Option<TestUuid> {
    let suffix = name.strip_prefix(WORKER_NAME_PREFIX)?;
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_name_round_trip() {
        let uuid = TestUuid::new_v4();
        let name = worker_bus_name(uuid);
        assert!(name.starts_with(WORKER_NAME_PREFIX));
        assert_eq!(parse_worker_bus_name(&name), Some(uuid));
        assert_eq!(parse_worker_bus_name("org.example.Other"), None);
        assert_eq!(parse_worker_bus_name("net.gauntlet.worker.not-a-uuid"), None);
    }
}
