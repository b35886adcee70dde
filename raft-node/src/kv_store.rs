//! A minimal key/value `DataOps`, standing in for whatever deterministic
//! state machine an embedder would plug in. `command` only ever sets a key;
//! `query` only ever reads one — enough to exercise the replication path
//! from the CLI's `set`/`get` commands.

use raft_core::DataOps;
use serde_json::{json, Value};

pub struct KvStore;

impl DataOps for KvStore {
    fn new(&self) -> Value {
        json!({})
    }

    fn command(&self, data: &Value, arg: &Value) -> (Value, Value) {
        let key = arg.get("key").and_then(Value::as_str).unwrap_or_default();
        let value = arg.get("value").cloned().unwrap_or(Value::Null);
        let mut next = data.clone();
        let previous = next
            .as_object_mut()
            .and_then(|m| m.insert(key.to_string(), value))
            .unwrap_or(Value::Null);
        (previous, next)
    }

    fn query(&self, data: &Value, arg: &Value) -> Value {
        let key = arg.get("key").and_then(Value::as_str).unwrap_or_default();
        data.get(key).cloned().unwrap_or(Value::Null)
    }
}
