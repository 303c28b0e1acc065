//! Key/value backends consulted by the storage proxy.
//!
//! A backend is scoped per session, per extension and per [`StorageArea`].
//! The same extension loaded into two sessions sees two disjoint stores.
//! Reads may hand back either plain JSON or an encoded blob;
//! [`StoredValue::decode`] turns both into a JSON value.

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::area::StorageArea;
use crate::database::Database;
use crate::Result;

/// A value as the backend holds it.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Json(Value),
    /// JSON text stored as raw bytes.
    Encoded(Vec<u8>),
}

impl StoredValue {
    pub fn decode(self) -> Result<Value> {
        match self {
            StoredValue::Json(value) => Ok(value),
            StoredValue::Encoded(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

/// Identifies one store: a session, an extension inside it and an area.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageScope {
    pub session_id: u32,
    pub extension_id: String,
    pub area: StorageArea,
}

impl StorageScope {
    pub fn new(session_id: u32, extension_id: impl Into<String>, area: StorageArea) -> Self {
        Self {
            session_id,
            extension_id: extension_id.into(),
            area,
        }
    }
}

pub trait StorageBackend: Send + Sync + 'static {
    /// Fetch `keys`, or every entry of the scope when `keys` is `None`.
    /// Missing keys are simply absent from the result.
    fn get(&self, scope: &StorageScope, keys: Option<&[String]>) -> Result<Vec<(String, StoredValue)>>;

    fn set(&self, scope: &StorageScope, items: &[(String, Value)]) -> Result<()>;

    fn remove(&self, scope: &StorageScope, keys: &[String]) -> Result<()>;

    fn clear(&self, scope: &StorageScope) -> Result<()>;
}

/// SQLite-backed storage, one row per key.
#[derive(Clone)]
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, scope: &StorageScope, keys: Option<&[String]>) -> Result<Vec<(String, StoredValue)>> {
        let area = scope.area.as_str();

        self.db.with_connection(|conn| {
            let entries = match keys {
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT key, value FROM extension_storage
                         WHERE session_id = ?1 AND extension_id = ?2 AND area = ?3
                         ORDER BY position",
                    )?;

                    let rows = stmt
                        .query_map(params![scope.session_id, scope.extension_id, area], |row| {
                            let key: String = row.get(0)?;
                            let value: Vec<u8> = row.get(1)?;
                            Ok((key, StoredValue::Encoded(value)))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                Some(keys) => {
                    let mut stmt = conn.prepare(
                        "SELECT value FROM extension_storage
                         WHERE session_id = ?1 AND extension_id = ?2 AND area = ?3 AND key = ?4",
                    )?;

                    let mut rows = Vec::with_capacity(keys.len());
                    for key in keys {
                        let value: Option<Vec<u8>> = stmt
                            .query_row(
                                params![scope.session_id, scope.extension_id, area, key],
                                |row| row.get(0),
                            )
                            .optional()?;
                        if let Some(value) = value {
                            rows.push((key.clone(), StoredValue::Encoded(value)));
                        }
                    }
                    rows
                }
            };

            Ok(entries)
        })
    }

    fn set(&self, scope: &StorageScope, items: &[(String, Value)]) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        let area = scope.area.as_str();

        self.db.transaction(|conn| {
            for (key, value) in items {
                let encoded = serde_json::to_vec(value)?;
                conn.execute(
                    "INSERT INTO extension_storage
                     (session_id, extension_id, area, key, value, position, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5,
                        COALESCE((SELECT MAX(position) FROM extension_storage
                                  WHERE session_id = ?1 AND extension_id = ?2 AND area = ?3), 0) + 1,
                        ?6)
                     ON CONFLICT(session_id, extension_id, area, key)
                     DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![scope.session_id, scope.extension_id, area, key, encoded, updated_at],
                )?;
            }
            Ok(())
        })?;

        tracing::debug!(
            session_id = scope.session_id,
            extension_id = %scope.extension_id,
            area = %scope.area,
            count = items.len(),
            "Stored extension values"
        );

        Ok(())
    }

    fn remove(&self, scope: &StorageScope, keys: &[String]) -> Result<()> {
        let area = scope.area.as_str();

        self.db.transaction(|conn| {
            for key in keys {
                conn.execute(
                    "DELETE FROM extension_storage
                     WHERE session_id = ?1 AND extension_id = ?2 AND area = ?3 AND key = ?4",
                    params![scope.session_id, scope.extension_id, area, key],
                )?;
            }
            Ok(())
        })
    }

    fn clear(&self, scope: &StorageScope) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM extension_storage
                 WHERE session_id = ?1 AND extension_id = ?2 AND area = ?3",
                params![scope.session_id, scope.extension_id, scope.area.as_str()],
            )?;
            Ok(())
        })?;

        tracing::info!(
            session_id = scope.session_id,
            extension_id = %scope.extension_id,
            area = %scope.area,
            "Cleared storage area"
        );

        Ok(())
    }
}

/// Volatile backend, used for the `session` area and in tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    areas: Arc<RwLock<HashMap<StorageScope, Vec<(String, Value)>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, scope: &StorageScope, keys: Option<&[String]>) -> Result<Vec<(String, StoredValue)>> {
        let areas = self.areas.read();
        let Some(entries) = areas.get(scope) else {
            return Ok(Vec::new());
        };

        let selected = entries
            .iter()
            .filter(|(key, _)| keys.map_or(true, |keys| keys.contains(key)))
            .map(|(key, value)| (key.clone(), StoredValue::Json(value.clone())))
            .collect();

        Ok(selected)
    }

    fn set(&self, scope: &StorageScope, items: &[(String, Value)]) -> Result<()> {
        let mut areas = self.areas.write();
        let entries = areas.entry(scope.clone()).or_default();

        for (key, value) in items {
            match entries.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = value.clone(),
                None => entries.push((key.clone(), value.clone())),
            }
        }

        Ok(())
    }

    fn remove(&self, scope: &StorageScope, keys: &[String]) -> Result<()> {
        if let Some(entries) = self.areas.write().get_mut(scope) {
            entries.retain(|(key, _)| !keys.contains(key));
        }
        Ok(())
    }

    fn clear(&self, scope: &StorageScope) -> Result<()> {
        self.areas.write().remove(scope);
        Ok(())
    }
}
