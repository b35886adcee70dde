//! Random command/query workload generation against the test key/value
//! store, for scenarios that want a stream of `set`/`get` operations
//! instead of hand-written ones.

use rand::Rng;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub enum Operation {
    Set { key: String, value: i64 },
    Get { key: String },
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_keys: usize,
    pub write_ratio: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_keys: 5,
            write_ratio: 0.8,
        }
    }
}

pub struct WorkloadGenerator {
    config: WorkloadConfig,
    next_value: i64,
}

impl WorkloadGenerator {
    pub fn new(config: WorkloadConfig) -> Self {
        Self { config, next_value: 0 }
    }

    pub fn next(&mut self) -> Operation {
        let key = format!("key_{}", rand::thread_rng().gen_range(0..self.config.num_keys));
        if rand::thread_rng().gen::<f64>() < self.config.write_ratio {
            let value = self.next_value;
            self.next_value += 1;
            Operation::Set { key, value }
        } else {
            Operation::Get { key }
        }
    }

    pub fn generate(&mut self, count: usize) -> Vec<Operation> {
        (0..count).map(|_| self.next()).collect()
    }
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Operation::Set { key, .. } => key,
            Operation::Get { key } => key,
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Operation::Set { value, .. } => json!(value),
            Operation::Get { .. } => Value::Null,
        }
    }
}
