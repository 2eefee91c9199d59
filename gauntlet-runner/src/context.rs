// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide harness state.
//!
//! A [`HarnessContext`] is created once by the top-level client and shared by
//! every [`TestRun`](crate::runner::TestRun) through an `Arc`. It owns the
//! test UUID allocator, the memoized generator output, the private bus (created
//! on first use) and a scratch directory.

use crate::{
    errors::{BusError, GeneratorError, HarnessContextError},
    ipc::Bus,
};
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use gauntlet_metadata::{TestUuid, Value};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::debug;

/// Shared state for all test runs in a process.
#[derive(Debug)]
pub struct HarnessContext {
    uuids: UuidAllocator,
    generators: GeneratorCache,
    bus: Mutex<Option<Arc<Bus>>>,
    scratch_dir: Utf8TempDir,
}

impl HarnessContext {
    /// Creates a new context with a fresh scratch directory.
    pub fn new() -> Result<Arc<Self>, HarnessContextError> {
        let scratch_dir = camino_tempfile::Builder::new()
            .prefix("gauntlet-")
            .tempdir()?;
        debug!(scratch_dir = %scratch_dir.path(), "created harness context");
        Ok(Arc::new(Self {
            uuids: UuidAllocator::new(),
            generators: GeneratorCache::new(),
            bus: Mutex::new(None),
            scratch_dir,
        }))
    }

    /// The test UUID allocator.
    pub fn uuids(&self) -> &UuidAllocator {
        &self.uuids
    }

    /// Generator output memoized across batches.
    pub fn generators(&self) -> &GeneratorCache {
        &self.generators
    }

    /// A directory that lives as long as the context.
    pub fn scratch_dir(&self) -> &Utf8Path {
        self.scratch_dir.path()
    }

    /// Returns the private bus, starting it on first use.
    pub fn bus(&self) -> Result<Arc<Bus>, BusError> {
        let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bus) = &*bus {
            return Ok(bus.clone());
        }
        let started = Arc::new(Bus::start(self.scratch_dir.path())?);
        *bus = Some(started.clone());
        Ok(started)
    }

    /// Tears the private bus down, if it was started.
    ///
    /// A later call to [`bus`](Self::bus) starts a new one.
    pub fn shutdown(&self) {
        let bus = self
            .bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(bus) = bus {
            bus.shutdown();
        }
    }
}

impl Drop for HarnessContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Hands out test UUIDs that are unique among those currently held.
#[derive(Clone, Debug, Default)]
pub struct UuidAllocator {
    held: Arc<Mutex<HashSet<TestUuid>>>,
}

impl UuidAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a UUID, held until the returned guard is dropped.
    pub fn allocate(&self) -> UuidGuard {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let uuid = TestUuid::new_v4();
            if held.insert(uuid) {
                return UuidGuard {
                    uuid,
                    held: self.held.clone(),
                };
            }
        }
    }

    /// The number of UUIDs currently held.
    pub fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds a test UUID; releases it back to its allocator on drop.
pub struct UuidGuard {
    uuid: TestUuid,
    held: Arc<Mutex<HashSet<TestUuid>>>,
}

impl UuidGuard {
    /// The held UUID.
    pub fn uuid(&self) -> TestUuid {
        self.uuid
    }
}

impl fmt::Debug for UuidGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UuidGuard").field(&self.uuid).finish()
    }
}

impl Drop for UuidGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.uuid);
    }
}

/// The rows produced by a generator.
pub type GeneratedRows = Arc<[Vec<Value>]>;

/// Generator output, memoized by cache key.
#[derive(Debug, Default)]
pub struct GeneratorCache {
    entries: Mutex<HashMap<String, GeneratedRows>>,
}

impl GeneratorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rows cached under `key`, generating them with `f` first if
    /// needed.
    ///
    /// Failures are not cached.
    pub fn get_or_try_insert(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<Vec<Vec<Value>>, GeneratorError>,
    ) -> Result<GeneratedRows, GeneratorError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rows) = entries.get(key) {
            debug!(key, "generator cache hit");
            return Ok(rows.clone());
        }
        let rows: GeneratedRows = f()?.into();
        entries.insert(key.to_owned(), rows.clone());
        Ok(rows)
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
