// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Class-info registration and name interning.

use crate::{ClassId, NameId, StoreError, schema::Tables};
use gauntlet_metadata::{ClassInfo, DictKind, Schema, SchemaKind};
use rusqlite::{Connection, params};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Caches the class-info rows of one database.
///
/// The store is the only writer of its connection, so the cache stays valid
/// for the lifetime of the store. It is cleared whenever a write transaction
/// fails, since rows it learned about may have been rolled back.
#[derive(Debug, Default)]
pub(crate) struct ClassCache {
    test: KindCache,
    monitor: KindCache,
}

#[derive(Debug, Default)]
struct KindCache {
    loaded: bool,
    classes: HashMap<String, CachedClass>,
    // Static schemas whose fields were checked against the database already.
    synced: HashSet<&'static str>,
}

#[derive(Debug)]
struct CachedClass {
    id: ClassId,
    parent: Option<String>,
    // Only the names declared by this class, not its ancestors.
    names: HashMap<(DictKind, String), NameId>,
}

impl ClassCache {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn kind(&self, kind: SchemaKind) -> &KindCache {
        match kind {
            SchemaKind::Test => &self.test,
            SchemaKind::Monitor => &self.monitor,
        }
    }

    fn kind_mut(&mut self, kind: SchemaKind) -> &mut KindCache {
        match kind {
            SchemaKind::Test => &mut self.test,
            SchemaKind::Monitor => &mut self.monitor,
        }
    }

    /// Loads every class-info row of `kind` on first use.
    pub(crate) fn ensure_loaded(
        &mut self,
        conn: &Connection,
        kind: SchemaKind,
    ) -> Result<(), StoreError> {
        if self.kind(kind).loaded {
            return Ok(());
        }
        let tables = Tables::for_kind(kind);

        let mut classes = HashMap::new();
        let mut by_id = HashMap::new();
        {
            let mut stmt = conn.prepare(&format!("SELECT id, type, parent FROM {}", tables.class()))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, ClassId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (id, name, parent) = row?;
                by_id.insert(id, name.clone());
                classes.insert(
                    name,
                    CachedClass {
                        id,
                        parent,
                        names: HashMap::new(),
                    },
                );
            }
        }

        for dict in DictKind::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, containerid, name FROM {}",
                tables.class_dict(dict)
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, NameId>(0)?,
                    row.get::<_, ClassId>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (name_id, class_id, name) = row?;
                if let Some(class) = by_id.get(&class_id).and_then(|c| classes.get_mut(c)) {
                    class.names.insert((dict, name), name_id);
                }
            }
        }

        debug!(%kind, count = classes.len(), "loaded class-info rows");
        let cache = self.kind_mut(kind);
        cache.classes = classes;
        cache.loaded = true;
        Ok(())
    }

    /// Returns the id of a known class.
    pub(crate) fn class_id(&self, kind: SchemaKind, name: &str) -> Option<ClassId> {
        self.kind(kind).classes.get(name).map(|class| class.id)
    }

    /// Registers a statically-declared schema and all its ancestors.
    pub(crate) fn ensure_schema(
        &mut self,
        conn: &Connection,
        schema: &'static Schema,
    ) -> Result<ClassId, StoreError> {
        let kind = schema.kind();
        self.ensure_loaded(conn, kind)?;
        if self.kind(kind).synced.contains(schema.name())
            && let Some(id) = self.class_id(kind, schema.name())
        {
            return Ok(id);
        }
        let mut chain: Vec<ClassInfo> = schema.ancestry().map(Schema::class_info).collect();
        chain.reverse();
        let id = self.ensure_chain(conn, kind, &chain)?;
        self.kind_mut(kind).synced.insert(schema.name());
        Ok(id)
    }

    /// Registers a class chain given root first, and returns the id of the
    /// last (most derived) class.
    ///
    /// Classes are matched purely by name. A class that already exists keeps
    /// its row, but any name it declares and does not own yet is added to its
    /// own dictionaries, even if an ancestor declares the same name.
    pub(crate) fn ensure_chain(
        &mut self,
        conn: &Connection,
        kind: SchemaKind,
        chain: &[ClassInfo],
    ) -> Result<ClassId, StoreError> {
        self.ensure_loaded(conn, kind)?;
        let tables = Tables::for_kind(kind);

        let mut last = None;
        for info in chain {
            let id = match self.class_id(kind, &info.name) {
                Some(id) => id,
                None => {
                    conn.execute(
                        &format!(
                            "INSERT INTO {} (type, parent, description) VALUES (?1, ?2, ?3)",
                            tables.class()
                        ),
                        params![info.name, info.parent, info.description],
                    )?;
                    let id = ClassId(conn.last_insert_rowid());
                    debug!(%kind, class = %info.name, %id, "registered class");
                    self.kind_mut(kind).classes.insert(
                        info.name.clone(),
                        CachedClass {
                            id,
                            parent: info.parent.clone(),
                            names: HashMap::new(),
                        },
                    );
                    id
                }
            };

            for dict in DictKind::ALL {
                for (name, description) in info.dict(dict) {
                    if self.own_name(kind, &info.name, dict, name).is_none() {
                        self.insert_name(conn, kind, &info.name, dict, name, description)?;
                    }
                }
            }
            last = Some(id);
        }

        last.ok_or_else(|| StoreError::UnknownClass {
            kind,
            name: String::new(),
        })
    }

    fn insert_name(
        &mut self,
        conn: &Connection,
        kind: SchemaKind,
        class: &str,
        dict: DictKind,
        name: &str,
        description: &str,
    ) -> Result<NameId, StoreError> {
        let tables = Tables::for_kind(kind);
        let class_id = self
            .class_id(kind, class)
            .ok_or_else(|| StoreError::UnknownClass {
                kind,
                name: class.to_owned(),
            })?;
        conn.execute(
            &format!(
                "INSERT INTO {} (containerid, name, txtvalue) VALUES (?1, ?2, ?3)",
                tables.class_dict(dict)
            ),
            params![class_id, name, description],
        )?;
        let name_id = NameId(conn.last_insert_rowid());
        if let Some(cached) = self.kind_mut(kind).classes.get_mut(class) {
            cached.names.insert((dict, name.to_owned()), name_id);
        }
        Ok(name_id)
    }

    fn own_name(&self, kind: SchemaKind, class: &str, dict: DictKind, name: &str) -> Option<NameId> {
        self.kind(kind)
            .classes
            .get(class)?
            .names
            .get(&(dict, name.to_owned()))
            .copied()
    }

    /// Resolves `name` for `class`, looking at the class itself first and
    /// then each ancestor in turn.
    pub(crate) fn resolve_name(
        &self,
        kind: SchemaKind,
        class: &str,
        dict: DictKind,
        name: &str,
    ) -> Option<NameId> {
        let cache = self.kind(kind);
        let key = (dict, name.to_owned());
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            let cached = cache.classes.get(current)?;
            if let Some(id) = cached.names.get(&key) {
                return Some(*id);
            }
            cursor = cached.parent.as_deref();
        }
        None
    }

    /// Like [`Self::resolve_name`], but produces an error for undeclared names.
    pub(crate) fn require_name(
        &self,
        kind: SchemaKind,
        class: &str,
        dict: DictKind,
        name: &str,
    ) -> Result<NameId, StoreError> {
        self.resolve_name(kind, class, dict, name)
            .ok_or_else(|| StoreError::UnknownName {
                kind,
                class: class.to_owned(),
                dict,
                name: name.to_owned(),
            })
    }
}
