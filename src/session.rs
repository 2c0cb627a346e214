//! Per-record context store
//!
//! One `Session` lives for the extraction of a single record. Rules write
//! into it with `@put:{k:v}` or `context.put(k, v)` and later rules of the
//! same record read it back with `@get:{k}`, `{{k}}` or `context.get(k)`.
//! A session is passed explicitly into every call and is never shared
//! between records.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Session {
    vars: HashMap<String, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }
}
