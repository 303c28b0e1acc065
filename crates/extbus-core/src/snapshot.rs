//! Background page snapshots
//!
//! `runtime.getBackgroundPage` cannot hand out a live object across
//! processes. Instead the router asks the background context for a pruned
//! structural copy of its global scope and forwards that. Requests are
//! correlated by a one-off id; a request that is not answered within the
//! configured timeout resolves to `null`.
//!
//! Pruning walks a [`ScopeGraph`]: objects and arrays may be shared or
//! cyclic, functions are dropped, depth and array length are capped, and
//! anything already visited or past the depth limit becomes a marker string.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use extbus_session::{ContextId, SessionId};

use crate::contexts::ContextTable;
use crate::error::BusError;
use crate::protocol::ContextEvent;
use crate::Result;

pub const PRUNED: &str = "-pruned-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOptions {
    pub depth: usize,
    pub array_max_length: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            depth: 6,
            array_max_length: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeNode {
    /// Null, bool, number or string
    Primitive(Value),
    Object(Vec<(String, NodeId)>),
    Array(Vec<NodeId>),
    Function,
}

/// An object graph with shared and cyclic references, rooted at node 0
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeGraph {
    nodes: Vec<ScopeNode>,
}

impl ScopeGraph {
    /// A graph whose root is an empty object
    pub fn new() -> Self {
        Self {
            nodes: vec![ScopeNode::Object(Vec::new())],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn add(&mut self, node: ScopeNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Option<&ScopeNode> {
        self.nodes.get(id.0)
    }

    /// Set `key` on an object node. Returns false if `object` is not one.
    pub fn set_property(&mut self, object: NodeId, key: &str, value: NodeId) -> bool {
        match self.nodes.get_mut(object.0) {
            Some(ScopeNode::Object(entries)) => {
                match entries.iter_mut().find(|(k, _)| k == key) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key.to_string(), value)),
                }
                true
            }
            _ => false,
        }
    }

    /// Append to an array node. Returns false if `array` is not one.
    pub fn push(&mut self, array: NodeId, value: NodeId) -> bool {
        match self.nodes.get_mut(array.0) {
            Some(ScopeNode::Array(items)) => {
                items.push(value);
                true
            }
            _ => false,
        }
    }

    /// Build a tree-shaped graph from a JSON value
    pub fn from_value(value: &Value) -> Self {
        let mut graph = Self { nodes: Vec::new() };
        graph.insert_value(value);
        graph
    }

    fn insert_value(&mut self, value: &Value) -> NodeId {
        match value {
            Value::Object(map) => {
                let id = self.add(ScopeNode::Object(Vec::new()));
                for (key, child) in map {
                    let child = self.insert_value(child);
                    self.set_property(id, key, child);
                }
                id
            }
            Value::Array(items) => {
                let id = self.add(ScopeNode::Array(Vec::new()));
                for child in items {
                    let child = self.insert_value(child);
                    self.push(id, child);
                }
                id
            }
            primitive => self.add(ScopeNode::Primitive(primitive.clone())),
        }
    }

    /// Cycle-free, depth-limited JSON copy of the graph
    pub fn prune(&self, options: PruneOptions) -> Value {
        let mut seen = HashSet::new();
        self.prune_node(self.root(), options.depth, &options, &mut seen)
            .unwrap_or(Value::Null)
    }

    /// `None` means the value is omitted (functions)
    fn prune_node(
        &self,
        id: NodeId,
        depth: usize,
        options: &PruneOptions,
        seen: &mut HashSet<NodeId>,
    ) -> Option<Value> {
        match self.node(id)? {
            ScopeNode::Primitive(value) => Some(value.clone()),
            ScopeNode::Function => None,
            ScopeNode::Array(items) => {
                if depth == 0 || !seen.insert(id) {
                    return Some(Value::String(PRUNED.to_string()));
                }
                Some(Value::Array(
                    items
                        .iter()
                        .take(options.array_max_length)
                        .map(|item| {
                            self.prune_node(*item, depth - 1, options, seen)
                                .unwrap_or(Value::Null)
                        })
                        .collect(),
                ))
            }
            ScopeNode::Object(entries) => {
                if depth == 0 || !seen.insert(id) {
                    return Some(Value::String(PRUNED.to_string()));
                }
                let mut map = Map::new();
                for (key, child) in entries {
                    if let Some(value) = self.prune_node(*child, depth - 1, options, seen) {
                        map.insert(key.clone(), value);
                    }
                }
                Some(Value::Object(map))
            }
        }
    }
}

impl Default for ScopeGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Outstanding snapshot requests keyed by correlation id
#[derive(Clone)]
pub struct BackgroundSerializer {
    pending: Arc<Mutex<HashMap<String, (SessionId, oneshot::Sender<Value>)>>>,
    timeout: Duration,
}

impl BackgroundSerializer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Ask `background` for a snapshot and wait for it
    pub async fn request(
        &self,
        contexts: &ContextTable,
        session_id: SessionId,
        background: ContextId,
    ) -> Result<Value> {
        let correlation_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(correlation_id.clone(), (session_id, tx));

        let sent = contexts.send(
            background,
            ContextEvent::SnapshotRequest {
                correlation_id: correlation_id.clone(),
            },
        );
        if let Err(e) = sent {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(BusError::StaleTarget(background)),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                Err(BusError::Timeout(format!(
                    "background snapshot {}",
                    correlation_id
                )))
            }
        }
    }

    /// Deliver a snapshot to its waiter. Replies from another session or for
    /// unknown ids are dropped.
    pub fn resolve(&self, session_id: SessionId, correlation_id: &str, snapshot: Value) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(correlation_id) {
            Some((owner, _)) if *owner == session_id => {}
            Some(_) => {
                tracing::warn!(session_id, correlation_id, "Snapshot reply from foreign session");
                return false;
            }
            None => return false,
        }

        match pending.remove(correlation_id) {
            Some((_, tx)) => tx.send(snapshot).is_ok(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn drop_session(&self, session_id: SessionId) {
        self.pending.lock().retain(|_, (owner, _)| *owner != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::ContextInfo;
    use serde_json::json;

    #[test]
    fn test_prune_tree() {
        let graph = ScopeGraph::from_value(&json!({"a": 1, "b": [true, "x"], "c": {"d": null}}));
        assert_eq!(
            graph.prune(PruneOptions::default()),
            json!({"a": 1, "b": [true, "x"], "c": {"d": null}})
        );
    }

    #[test]
    fn test_prune_cycle_and_function() {
        let mut graph = ScopeGraph::new();
        let root = graph.root();
        let child = graph.add(ScopeNode::Object(Vec::new()));
        let func = graph.add(ScopeNode::Function);
        let num = graph.add(ScopeNode::Primitive(json!(7)));

        graph.set_property(root, "child", child);
        graph.set_property(root, "handler", func);
        graph.set_property(child, "n", num);
        graph.set_property(child, "parent", root);

        assert_eq!(
            graph.prune(PruneOptions::default()),
            json!({"child": {"n": 7, "parent": PRUNED}})
        );
    }

    #[test]
    fn test_prune_shared_reference() {
        let mut graph = ScopeGraph::new();
        let root = graph.root();
        let shared = graph.add(ScopeNode::Array(Vec::new()));
        graph.set_property(root, "first", shared);
        graph.set_property(root, "second", shared);

        assert_eq!(
            graph.prune(PruneOptions::default()),
            json!({"first": [], "second": PRUNED})
        );
    }

    #[test]
    fn test_prune_depth_and_length() {
        let mut graph = ScopeGraph::new();
        let mut parent = graph.root();
        for _ in 0..8 {
            let next = graph.add(ScopeNode::Object(Vec::new()));
            graph.set_property(parent, "next", next);
            parent = next;
        }
        let pruned = graph.prune(PruneOptions {
            depth: 3,
            array_max_length: 50,
        });
        assert_eq!(pruned, json!({"next": {"next": {"next": PRUNED}}}));

        let long: Vec<Value> = (0..60).map(|i| json!(i)).collect();
        let graph = ScopeGraph::from_value(&json!({ "items": long }));
        let pruned = graph.prune(PruneOptions::default());
        assert_eq!(pruned["items"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn test_function_in_array_becomes_null() {
        let mut graph = ScopeGraph::new();
        let root = graph.root();
        let items = graph.add(ScopeNode::Array(Vec::new()));
        let func = graph.add(ScopeNode::Function);
        graph.push(items, func);
        graph.set_property(root, "items", items);

        assert_eq!(graph.prune(PruneOptions::default()), json!({"items": [null]}));
    }

    #[tokio::test]
    async fn test_request_resolves() {
        let contexts = ContextTable::new();
        let (bg, mut bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        let serializer = BackgroundSerializer::new(Duration::from_secs(5));

        let responder = serializer.clone();
        tokio::spawn(async move {
            if let Some(ContextEvent::SnapshotRequest { correlation_id }) = bg_rx.recv().await {
                assert!(!responder.resolve(2, &correlation_id, json!("wrong session")));
                responder.resolve(1, &correlation_id, json!({"answer": 42}));
            }
        });

        let snapshot = serializer.request(&contexts, 1, bg).await.unwrap();
        assert_eq!(snapshot, json!({"answer": 42}));
        assert_eq!(serializer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let contexts = ContextTable::new();
        let (bg, _bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        let serializer = BackgroundSerializer::new(Duration::from_millis(100));

        let err = serializer.request(&contexts, 1, bg).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert_eq!(serializer.pending(), 0);
    }

    #[tokio::test]
    async fn test_request_to_dead_background() {
        let contexts = ContextTable::new();
        let (bg, bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        drop(bg_rx);
        let serializer = BackgroundSerializer::new(Duration::from_secs(1));

        assert!(matches!(
            serializer.request(&contexts, 1, bg).await,
            Err(BusError::StaleTarget(_))
        ));
        assert_eq!(serializer.pending(), 0);
    }
}
