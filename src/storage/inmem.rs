//! Process-local backend over a sorted map.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{immediate_children, Backend, Capabilities, Transactional, TxnOp};
use crate::error::Result;

/// In-memory backend.
///
/// Cloning shares the underlying map, so a clone handed to a fresh `Core`
/// behaves like the same storage surviving a process restart.
#[derive(Debug, Clone, Default)]
pub struct InmemBackend {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InmemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Backend for InmemBackend {
    fn name(&self) -> &'static str {
        "inmem"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactional: true,
            ..Capabilities::default()
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let keys = entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        Ok(immediate_children(keys, prefix))
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for InmemBackend {
    fn transaction(&self, ops: &[TxnOp]) -> Result<()> {
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                TxnOp::Delete { key } => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_contract() {
        let backend = InmemBackend::new();
        assert_eq!(backend.get("missing").unwrap(), None);

        backend.put("secret/foo", b"1").unwrap();
        backend.put("secret/bar/baz", b"2").unwrap();
        backend.put("other", b"3").unwrap();

        assert_eq!(backend.get("secret/foo").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(backend.list("secret/").unwrap(), vec!["bar/", "foo"]);
        assert_eq!(backend.list("").unwrap(), vec!["other", "secret/"]);

        backend.delete("secret/foo").unwrap();
        backend.delete("secret/foo").unwrap();
        assert_eq!(backend.get("secret/foo").unwrap(), None);
    }

    #[test]
    fn test_clone_shares_storage() {
        let backend = InmemBackend::new();
        let reopened = backend.clone();
        backend.put("k", b"v").unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn test_transaction() {
        let backend = InmemBackend::new();
        backend.put("gone", b"x").unwrap();
        backend
            .transaction(&[
                TxnOp::Put { key: "a".into(), value: b"1".to_vec() },
                TxnOp::Delete { key: "gone".into() },
            ])
            .unwrap();
        assert_eq!(backend.list("").unwrap(), vec!["a"]);
    }
}
