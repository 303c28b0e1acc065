//! Storage proxy
//!
//! Executes `storage.<area>.get/set/remove/clear` against the configured
//! backends. Backend calls block, so they run on the blocking pool and the
//! router never waits on them. The `session` area lives in memory; every
//! other area is persistent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use extbus_session::SessionId;
use extbus_storage::{StorageArea, StorageBackend, StorageScope};

use crate::error::BusError;
use crate::protocol::{StorageOperationKind, StorageRequest};
use crate::Result;

/// The forms `storage.get` accepts for its keys argument
#[derive(Debug, Clone, PartialEq)]
pub enum KeyQuery {
    All,
    Keys(Vec<String>),
    /// Keys with default values, echoed back when nothing is stored
    Defaults(Map<String, Value>),
}

impl KeyQuery {
    pub fn from_arg(arg: &Value) -> Result<Self> {
        match arg {
            Value::Null => Ok(KeyQuery::All),
            Value::String(key) => Ok(KeyQuery::Keys(vec![key.clone()])),
            Value::Array(_) => Ok(KeyQuery::Keys(keys_of(arg)?)),
            Value::Object(defaults) => Ok(KeyQuery::Defaults(defaults.clone())),
            other => Err(BusError::InvalidArgument(format!(
                "storage keys must be null, a string, an array or an object, got {}",
                other
            ))),
        }
    }

    fn keys(&self) -> Option<Vec<String>> {
        match self {
            KeyQuery::All => None,
            KeyQuery::Keys(keys) => Some(keys.clone()),
            KeyQuery::Defaults(defaults) => Some(defaults.keys().cloned().collect()),
        }
    }
}

fn keys_of(arg: &Value) -> Result<Vec<String>> {
    match arg {
        Value::String(key) => Ok(vec![key.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    BusError::InvalidArgument(format!("storage key must be a string, got {}", item))
                })
            })
            .collect(),
        other => Err(BusError::InvalidArgument(format!(
            "expected a key or list of keys, got {}",
            other
        ))),
    }
}

/// Reply payload on `api-storage-operation-<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageReply {
    Ok(Value),
    Error(String),
}

impl StorageReply {
    pub fn into_result(self) -> Result<Value> {
        match self {
            StorageReply::Ok(value) => Ok(value),
            StorageReply::Error(message) => Err(BusError::BackendFailure(message)),
        }
    }
}

#[derive(Clone)]
pub struct StorageProxy {
    persistent: Arc<dyn StorageBackend>,
    volatile: Arc<dyn StorageBackend>,
}

impl StorageProxy {
    pub fn new(persistent: Arc<dyn StorageBackend>, volatile: Arc<dyn StorageBackend>) -> Self {
        Self {
            persistent,
            volatile,
        }
    }

    fn backend_for(&self, area: StorageArea) -> Arc<dyn StorageBackend> {
        match area {
            StorageArea::Session => Arc::clone(&self.volatile),
            _ => Arc::clone(&self.persistent),
        }
    }

    pub async fn get(
        &self,
        session_id: SessionId,
        extension_id: &str,
        area: StorageArea,
        query: KeyQuery,
    ) -> Result<Value> {
        let backend = self.backend_for(area);
        let scope = StorageScope::new(session_id, extension_id, area);
        let keys = query.keys();

        let entries = blocking(move || backend.get(&scope, keys.as_deref())).await?;

        let mut result = Map::new();
        for (key, stored) in entries {
            match stored.decode() {
                Ok(value) => {
                    result.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(session_id, extension_id, area = %area, key = %key, error = %e, "Skipping undecodable value")
                }
            }
        }

        if result.is_empty() {
            if let KeyQuery::Defaults(defaults) = query {
                return Ok(Value::Object(defaults));
            }
        }

        Ok(Value::Object(result))
    }

    pub async fn set(
        &self,
        session_id: SessionId,
        extension_id: &str,
        area: StorageArea,
        items: Map<String, Value>,
    ) -> Result<()> {
        let backend = self.backend_for(area);
        let scope = StorageScope::new(session_id, extension_id, area);
        let items: Vec<(String, Value)> = items.into_iter().collect();

        blocking(move || backend.set(&scope, &items)).await
    }

    pub async fn remove(
        &self,
        session_id: SessionId,
        extension_id: &str,
        area: StorageArea,
        keys: Vec<String>,
    ) -> Result<()> {
        let backend = self.backend_for(area);
        let scope = StorageScope::new(session_id, extension_id, area);

        blocking(move || backend.remove(&scope, &keys)).await
    }

    pub async fn clear(&self, session_id: SessionId, extension_id: &str, area: StorageArea) -> Result<()> {
        let backend = self.backend_for(area);
        let scope = StorageScope::new(session_id, extension_id, area);

        blocking(move || backend.clear(&scope)).await
    }

    /// Run one request from `session_id` and shape the reply. Mutations
    /// answer with `null`.
    pub async fn execute(&self, session_id: SessionId, request: &StorageRequest) -> StorageReply {
        let outcome = match request.kind {
            StorageOperationKind::Get => match KeyQuery::from_arg(&request.arg) {
                Ok(query) => self.get(session_id, &request.extension_id, request.area, query).await,
                Err(e) => Err(e),
            },
            StorageOperationKind::Set => match &request.arg {
                Value::Object(items) => self
                    .set(session_id, &request.extension_id, request.area, items.clone())
                    .await
                    .map(|_| Value::Null),
                other => Err(BusError::InvalidArgument(format!(
                    "storage.set expects an object, got {}",
                    other
                ))),
            },
            StorageOperationKind::Remove => match keys_of(&request.arg) {
                Ok(keys) => self
                    .remove(session_id, &request.extension_id, request.area, keys)
                    .await
                    .map(|_| Value::Null),
                Err(e) => Err(e),
            },
            StorageOperationKind::Clear => self
                .clear(session_id, &request.extension_id, request.area)
                .await
                .map(|_| Value::Null),
        };

        match outcome {
            Ok(value) => StorageReply::Ok(value),
            Err(e) => {
                e.report("storage");
                StorageReply::Error(e.to_string())
            }
        }
    }
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> extbus_storage::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BusError::BackendFailure(e.to_string()))?
        .map_err(BusError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use extbus_storage::{Database, MemoryBackend, SqliteBackend};
    use serde_json::json;

    fn proxy() -> StorageProxy {
        let db = Database::open_in_memory().unwrap();
        StorageProxy::new(
            Arc::new(SqliteBackend::new(db)),
            Arc::new(MemoryBackend::new()),
        )
    }

    fn request(kind: StorageOperationKind, area: StorageArea, arg: Value) -> StorageRequest {
        StorageRequest {
            id: RequestId::Number(1),
            extension_id: "ext-a".to_string(),
            area,
            kind,
            arg,
        }
    }

    #[test]
    fn test_key_query_forms() {
        assert_eq!(KeyQuery::from_arg(&Value::Null).unwrap(), KeyQuery::All);
        assert_eq!(
            KeyQuery::from_arg(&json!("a")).unwrap(),
            KeyQuery::Keys(vec!["a".to_string()])
        );
        assert_eq!(
            KeyQuery::from_arg(&json!(["a", "b"])).unwrap(),
            KeyQuery::Keys(vec!["a".to_string(), "b".to_string()])
        );
        assert!(matches!(
            KeyQuery::from_arg(&json!({"a": 1})).unwrap(),
            KeyQuery::Defaults(_)
        ));
        assert!(KeyQuery::from_arg(&json!(5)).is_err());
        assert!(KeyQuery::from_arg(&json!(["a", 5])).is_err());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let proxy = proxy();
        let set = proxy
            .execute(1, &request(
                StorageOperationKind::Set,
                StorageArea::Local,
                json!({"k": 1, "other": "x"}),
            ))
            .await;
        assert_eq!(set, StorageReply::Ok(Value::Null));

        let got = proxy
            .execute(1, &request(StorageOperationKind::Get, StorageArea::Local, json!(["k"])))
            .await;
        assert_eq!(got, StorageReply::Ok(json!({"k": 1})));

        let all = proxy
            .execute(1, &request(StorageOperationKind::Get, StorageArea::Local, Value::Null))
            .await;
        assert_eq!(all, StorageReply::Ok(json!({"k": 1, "other": "x"})));
    }

    #[tokio::test]
    async fn test_defaults_echoed_when_nothing_stored() {
        let proxy = proxy();
        let got = proxy
            .execute(1, &request(
                StorageOperationKind::Get,
                StorageArea::Local,
                json!({"theme": "dark"}),
            ))
            .await;
        assert_eq!(got, StorageReply::Ok(json!({"theme": "dark"})));
    }

    #[tokio::test]
    async fn test_defaults_not_merged_when_something_stored() {
        let proxy = proxy();
        proxy
            .set(1, "ext-a", StorageArea::Local, json!({"theme": "light"}).as_object().unwrap().clone())
            .await
            .unwrap();

        let got = proxy
            .get(
                1,
                "ext-a",
                StorageArea::Local,
                KeyQuery::from_arg(&json!({"theme": "dark", "size": 3})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(got, json!({"theme": "light"}));
    }

    #[tokio::test]
    async fn test_session_area_is_separate() {
        let proxy = proxy();
        proxy
            .set(1, "ext-a", StorageArea::Session, json!({"k": true}).as_object().unwrap().clone())
            .await
            .unwrap();

        let local = proxy.get(1, "ext-a", StorageArea::Local, KeyQuery::All).await.unwrap();
        let session = proxy.get(1, "ext-a", StorageArea::Session, KeyQuery::All).await.unwrap();
        assert_eq!(local, json!({}));
        assert_eq!(session, json!({"k": true}));
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_data() {
        let proxy = proxy();
        let set = proxy
            .execute(1, &request(StorageOperationKind::Set, StorageArea::Local, json!({"token": "profile-1"})))
            .await;
        assert_eq!(set, StorageReply::Ok(Value::Null));

        let other = proxy
            .execute(2, &request(StorageOperationKind::Get, StorageArea::Local, Value::Null))
            .await;
        assert_eq!(other, StorageReply::Ok(json!({})));

        proxy
            .execute(2, &request(StorageOperationKind::Clear, StorageArea::Local, Value::Null))
            .await;
        let own = proxy
            .execute(1, &request(StorageOperationKind::Get, StorageArea::Local, json!("token")))
            .await;
        assert_eq!(own, StorageReply::Ok(json!({"token": "profile-1"})));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let proxy = proxy();
        proxy
            .set(1, "ext-a", StorageArea::Sync, json!({"a": 1, "b": 2, "c": 3}).as_object().unwrap().clone())
            .await
            .unwrap();

        let removed = proxy
            .execute(1, &request(StorageOperationKind::Remove, StorageArea::Sync, json!("a")))
            .await;
        assert_eq!(removed, StorageReply::Ok(Value::Null));
        assert_eq!(
            proxy.get(1, "ext-a", StorageArea::Sync, KeyQuery::All).await.unwrap(),
            json!({"b": 2, "c": 3})
        );

        proxy
            .execute(1, &request(StorageOperationKind::Clear, StorageArea::Sync, Value::Null))
            .await;
        assert_eq!(
            proxy.get(1, "ext-a", StorageArea::Sync, KeyQuery::All).await.unwrap(),
            json!({})
        );
    }

    #[tokio::test]
    async fn test_invalid_set_argument() {
        let proxy = proxy();
        let reply = proxy
            .execute(1, &request(StorageOperationKind::Set, StorageArea::Local, json!([1, 2])))
            .await;
        assert!(matches!(reply, StorageReply::Error(_)));
        assert!(reply.into_result().is_err());
    }

    #[test]
    fn test_reply_wire_shape() {
        assert_eq!(
            serde_json::to_value(StorageReply::Ok(json!({"k": 1}))).unwrap(),
            json!({"ok": {"k": 1}})
        );
        assert_eq!(
            serde_json::to_value(StorageReply::Error("boom".to_string())).unwrap(),
            json!({"error": "boom"})
        );
    }
}
