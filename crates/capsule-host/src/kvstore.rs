//! In-memory key/value capability.
//!
//! Namespace `kvstore`, keyed by the host call's `key` argument:
//!
//! | operation | payload | result |
//! |-----------|---------|--------|
//! | `get`     | -       | stored value, or `NotFound` |
//! | `set`     | value   | empty |
//! | `delete`  | -       | empty, whether or not the key existed |
//! | `keys`    | -       | `{"keys": [...]}`, sorted |

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::Capability;
use capsule_common::CallbackError;
use capsule_core::CallContext;

/// Namespace served by [`KvStoreCapability`].
pub const NAMESPACE: &str = "kvstore";

/// Process-local key/value store shared by every module.
#[derive(Debug, Default)]
pub struct KvStoreCapability {
    entries: DashMap<String, Vec<u8>>,
}

#[derive(Serialize)]
struct KeyList<'a> {
    keys: Vec<&'a str>,
}

impl KvStoreCapability {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn keys(&self) -> Result<Vec<u8>, CallbackError> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        let list = KeyList {
            keys: keys.iter().map(String::as_str).collect(),
        };
        serde_json::to_vec(&list).map_err(|e| CallbackError::failed(e.to_string()))
    }
}

fn require_key(key: &str) -> Result<&str, CallbackError> {
    if key.is_empty() {
        return Err(CallbackError::invalid_argument("key must not be empty"));
    }
    Ok(key)
}

#[async_trait]
impl Capability for KvStoreCapability {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn call(
        &self,
        ctx: &CallContext,
        operation: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        debug!(request_id = %ctx.request_id(), operation, key, "kvstore call");

        match operation {
            "get" => {
                let key = require_key(key)?;
                self.entries
                    .get(key)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| CallbackError::NotFound {
                        key: key.to_string(),
                    })
            }
            "set" => {
                let key = require_key(key)?;
                self.entries.insert(key.to_string(), payload.to_vec());
                Ok(Vec::new())
            }
            "delete" => {
                let key = require_key(key)?;
                self.entries.remove(key);
                Ok(Vec::new())
            }
            "keys" => self.keys(),
            _ => Err(CallbackError::UnknownOperation {
                namespace: NAMESPACE.to_string(),
                operation: operation.to_string(),
            }),
        }
    }
}
