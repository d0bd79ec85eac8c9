//! The encryption barrier.
//!
//! Every byte that crosses into storage passes through here. Entries are
//! encrypted with the active keyring term's data key and tagged with that
//! term, so rotation never invalidates older ciphertext. The keyring itself
//! is stored at [`KEYRING_PATH`], encrypted under a key derived from the
//! root key.
//!
//! While sealed the barrier holds no key material at all, and every data
//! operation fails with `Sealed` before touching the backend.
//!
//! ## Entry layout
//!
//! ```text
//! [ format (1) ][ term u32 BE (4) ][ nonce (12) ][ ciphertext ][ tag (16) ]
//! ```
//!
//! The additional authenticated data is `term || path`: an entry copied to
//! another path, or re-tagged with a different term, fails authentication.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::error::{Result, SealvaultError};
use crate::keys::{self, DataKey, RootKey};
use crate::storage::{apply_sequentially, Backend, TxnOp};

/// Where the encrypted keyring lives.
pub const KEYRING_PATH: &str = "core/keyring";

const ENTRY_FORMAT: u8 = 1;
const HEADER_LEN: usize = 5;

/// Term reserved for the keyring blob. Data terms start at 1.
const KEYRING_TERM: u32 = 0;

// ---------------------------------------------------------------------------
// Storage entry
// ---------------------------------------------------------------------------

/// An encrypted value as the barrier writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub path: String,
    pub term: u32,
    /// Nonce, ciphertext and tag.
    pub ciphertext: Vec<u8>,
}

impl StorageEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.push(ENTRY_FORMAT);
        out.extend_from_slice(&self.term.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse stored bytes. A malformed header counts as tampering.
    pub fn decode(path: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || bytes[0] != ENTRY_FORMAT {
            return Err(SealvaultError::AuthenticationFailed);
        }
        let mut term = [0u8; 4];
        term.copy_from_slice(&bytes[1..HEADER_LEN]);
        Ok(Self {
            path: path.to_string(),
            term: u32::from_be_bytes(term),
            ciphertext: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

fn additional_data(term: u32, path: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + path.len());
    aad.extend_from_slice(&term.to_be_bytes());
    aad.extend_from_slice(path.as_bytes());
    aad
}

fn seal_entry(key: &DataKey, term: u32, path: &str, plaintext: &[u8]) -> Result<StorageEntry> {
    let ciphertext = crypto::encrypt(key.as_bytes(), &additional_data(term, path), plaintext)?;
    Ok(StorageEntry {
        path: path.to_string(),
        term,
        ciphertext,
    })
}

fn open_entry(key: &DataKey, entry: &StorageEntry) -> Result<Vec<u8>> {
    crypto::decrypt(
        key.as_bytes(),
        &additional_data(entry.term, &entry.path),
        &entry.ciphertext,
    )
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

struct TermKey {
    key: DataKey,
    installed_at: DateTime<Utc>,
}

/// In-memory keyring: the root key plus every data-key term.
pub(crate) struct Keyring {
    root: RootKey,
    active: u32,
    terms: BTreeMap<u32, TermKey>,
}

#[derive(Serialize, Deserialize)]
struct KeyringDocument {
    active_term: u32,
    terms: Vec<TermDocument>,
}

#[derive(Serialize, Deserialize)]
struct TermDocument {
    term: u32,
    key: Vec<u8>,
    installed_at: DateTime<Utc>,
}

impl Drop for TermDocument {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl Keyring {
    fn first(root: RootKey) -> Result<Self> {
        let mut terms = BTreeMap::new();
        terms.insert(
            1,
            TermKey {
                key: DataKey::generate()?,
                installed_at: Utc::now(),
            },
        );
        Ok(Self {
            root,
            active: 1,
            terms,
        })
    }

    fn active_key(&self) -> Result<&DataKey> {
        self.terms
            .get(&self.active)
            .map(|t| &t.key)
            .ok_or(SealvaultError::AuthenticationFailed)
    }

    fn copy_terms(&self) -> BTreeMap<u32, TermKey> {
        self.terms
            .iter()
            .map(|(&term, t)| {
                (
                    term,
                    TermKey {
                        key: t.key.duplicate(),
                        installed_at: t.installed_at,
                    },
                )
            })
            .collect()
    }

    /// The next snapshot, with a fresh active term appended.
    fn with_new_term(&self) -> Result<Self> {
        let next = self.terms.keys().next_back().copied().unwrap_or(0) + 1;
        let mut terms = self.copy_terms();
        terms.insert(
            next,
            TermKey {
                key: DataKey::generate()?,
                installed_at: Utc::now(),
            },
        );
        Ok(Self {
            root: self.root.duplicate(),
            active: next,
            terms,
        })
    }

    /// The same terms protected by a different root key.
    fn with_root(&self, root: RootKey) -> Self {
        Self {
            root,
            active: self.active,
            terms: self.copy_terms(),
        }
    }

    /// Serialize and encrypt under the root-derived keyring key.
    fn seal(&self) -> Result<Vec<u8>> {
        let doc = KeyringDocument {
            active_term: self.active,
            terms: self
                .terms
                .iter()
                .map(|(&term, t)| TermDocument {
                    term,
                    key: t.key.as_bytes().to_vec(),
                    installed_at: t.installed_at,
                })
                .collect(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&doc)?);
        let protect = keys::derive_key(&self.root, keys::purpose::KEYRING)?;
        Ok(seal_entry(&protect, KEYRING_TERM, KEYRING_PATH, &plaintext)?.encode())
    }

    /// Decrypt a stored keyring. A wrong root key fails authentication.
    fn open(root: RootKey, stored: &[u8]) -> Result<Self> {
        let entry = StorageEntry::decode(KEYRING_PATH, stored)?;
        if entry.term != KEYRING_TERM {
            return Err(SealvaultError::AuthenticationFailed);
        }
        let protect = keys::derive_key(&root, keys::purpose::KEYRING)?;
        let plaintext = Zeroizing::new(open_entry(&protect, &entry)?);
        let doc: KeyringDocument = serde_json::from_slice(&plaintext)?;

        let mut terms = BTreeMap::new();
        for t in &doc.terms {
            terms.insert(
                t.term,
                TermKey {
                    key: DataKey::from_slice(&t.key)?,
                    installed_at: t.installed_at,
                },
            );
        }
        if !terms.contains_key(&doc.active_term) {
            return Err(SealvaultError::Serialization("keyring has no active term".into()));
        }

        Ok(Self {
            root,
            active: doc.active_term,
            terms,
        })
    }
}

/// The active keyring term and when it was installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub term: u32,
    pub installed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

/// Encrypting wrapper around a storage backend.
pub struct Barrier {
    backend: Arc<dyn Backend>,
    keyring: RwLock<Option<Arc<Keyring>>>,
    /// Serializes keyring writers (rotate, rekey).
    rotation: Mutex<()>,
}

impl Barrier {
    /// A sealed barrier over `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            keyring: RwLock::new(None),
            rotation: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Create keyring term 1 protected by `root` and persist it along with
    /// `entries`, encrypted under that term, and `companions`, written as is.
    ///
    /// Everything lands together or not at all, and `companions` are written
    /// last. Any keyring left behind by an earlier failed attempt is
    /// overwritten: whether the node counts as initialized is for the caller
    /// to decide. The barrier stays sealed afterwards.
    pub fn initialize(
        &self,
        root: &RootKey,
        entries: Vec<(String, Vec<u8>)>,
        companions: Vec<TxnOp>,
    ) -> Result<()> {
        let _writer = self.rotation.lock();
        let keyring = Keyring::first(root.duplicate())?;

        let mut ops = vec![TxnOp::Put {
            key: KEYRING_PATH.to_string(),
            value: keyring.seal()?,
        }];
        for (path, plaintext) in entries {
            let plaintext = Zeroizing::new(plaintext);
            let entry = seal_entry(keyring.active_key()?, keyring.active, &path, &plaintext)?;
            ops.push(TxnOp::Put {
                key: path,
                value: entry.encode(),
            });
        }
        ops.extend(companions);

        self.persist(&ops)?;
        info!(backend = self.backend.name(), "barrier initialized with keyring term 1");
        Ok(())
    }

    /// Load the keyring with `root` and hold it in memory.
    ///
    /// A root key that does not open the keyring fails with
    /// `AuthenticationFailed` and leaves the barrier sealed.
    pub fn unseal(&self, root: RootKey) -> Result<()> {
        if !self.is_sealed() {
            return Ok(());
        }
        let stored = self
            .backend
            .get(KEYRING_PATH)?
            .ok_or(SealvaultError::NotInitialized)?;
        let keyring = Keyring::open(root, &stored)?;
        let active = keyring.active;
        *self.keyring.write() = Some(Arc::new(keyring));
        info!(active_term = active, "barrier unsealed");
        Ok(())
    }

    /// Drop every key from memory. Stored data is untouched.
    pub fn seal(&self) {
        if self.keyring.write().take().is_some() {
            info!("barrier sealed");
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.keyring.read().is_none()
    }

    fn snapshot(&self) -> Result<Arc<Keyring>> {
        self.keyring.read().clone().ok_or(SealvaultError::Sealed)
    }

    /// Encrypt `plaintext` for `path` under the active term.
    pub fn encrypt(&self, path: &str, plaintext: &[u8]) -> Result<StorageEntry> {
        let keyring = self.snapshot()?;
        seal_entry(keyring.active_key()?, keyring.active, path, plaintext)
    }

    /// Decrypt with the term recorded on the entry.
    pub fn decrypt(&self, entry: &StorageEntry) -> Result<Vec<u8>> {
        let keyring = self.snapshot()?;
        let term = keyring
            .terms
            .get(&entry.term)
            .ok_or(SealvaultError::AuthenticationFailed)?;
        open_entry(&term.key, entry)
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.snapshot()?;
        match self.backend.get(path)? {
            Some(bytes) => {
                let entry = StorageEntry::decode(path, &bytes)?;
                Ok(Some(self.decrypt(&entry)?))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let entry = self.encrypt(path, value)?;
        self.backend.put(path, &entry.encode())?;
        debug!(path, term = entry.term, "barrier wrote entry");
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.snapshot()?;
        self.backend.delete(path)
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.snapshot()?;
        self.backend.list(prefix)
    }

    /// Append a new data-key term and make it active.
    ///
    /// Existing entries keep their term and stay readable; each is
    /// re-encrypted under the new term the next time it is written.
    pub fn rotate(&self) -> Result<u32> {
        let _writer = self.rotation.lock();
        let next = self.snapshot()?.with_new_term()?;
        self.backend.put(KEYRING_PATH, &next.seal()?)?;

        let term = next.active;
        self.install(next);
        info!(term, "rotated barrier keyring");
        Ok(term)
    }

    /// Re-protect the keyring under `new_root`, writing `companions` with it.
    ///
    /// Data keys are unchanged. If any write fails the stored keyring still
    /// opens with the old root. Once this returns `Ok` only `new_root` opens
    /// it, even if the barrier was sealed in the meantime.
    pub fn rekey(&self, new_root: RootKey, companions: Vec<TxnOp>) -> Result<()> {
        let _writer = self.rotation.lock();
        let next = self.snapshot()?.with_root(new_root);

        let mut ops = vec![TxnOp::Put {
            key: KEYRING_PATH.to_string(),
            value: next.seal()?,
        }];
        ops.extend(companions);
        self.persist(&ops)?;

        self.install(next);
        info!("keyring re-protected under a new root key");
        Ok(())
    }

    /// Write `ops` atomically when the backend supports transactions.
    ///
    /// Otherwise they are written in order. If one fails, every key touched
    /// is put back to the value it held before and the first error returned.
    fn persist(&self, ops: &[TxnOp]) -> Result<()> {
        if let Some(txn) = self.backend.as_transactional() {
            return txn.transaction(ops);
        }

        let mut undo = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key();
            undo.push(match self.backend.get(key)? {
                Some(value) => TxnOp::Put {
                    key: key.to_string(),
                    value,
                },
                None => TxnOp::Delete {
                    key: key.to_string(),
                },
            });
        }

        let Err(err) = apply_sequentially(self.backend.as_ref(), ops) else {
            return Ok(());
        };
        warn!(
            backend = self.backend.name(),
            error = %err,
            "sequential write failed, restoring previous values"
        );
        for op in undo.iter().rev() {
            if let Err(undo_err) = apply_sequentially(self.backend.as_ref(), std::slice::from_ref(op)) {
                error!(key = op.key(), error = %undo_err, "could not restore previous value");
            }
        }
        Err(err)
    }

    /// Swap in `keyring` as the in-memory snapshot.
    ///
    /// A barrier sealed while the keyring was being written stays sealed;
    /// the stored keyring is current either way.
    fn install(&self, keyring: Keyring) {
        let mut slot = self.keyring.write();
        if slot.is_none() {
            debug!("barrier sealed during keyring update");
            return;
        }
        *slot = Some(Arc::new(keyring));
    }

    pub fn key_status(&self) -> Result<KeyStatus> {
        let keyring = self.snapshot()?;
        let active = keyring
            .terms
            .get(&keyring.active)
            .ok_or(SealvaultError::AuthenticationFailed)?;
        Ok(KeyStatus {
            term: keyring.active,
            installed_at: active.installed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    use crate::error::BackendError;
    use crate::storage::{Capabilities, InmemBackend, KvBackend, LoopbackKv, RetryPolicy};

    fn unsealed() -> (InmemBackend, Barrier, [u8; 32]) {
        let backend = InmemBackend::new();
        let barrier = Barrier::new(Arc::new(backend.clone()));
        let root_bytes = crypto::generate_random_key().unwrap();
        barrier
            .initialize(&RootKey::from_bytes(root_bytes), Vec::new(), Vec::new())
            .unwrap();
        barrier.unseal(RootKey::from_bytes(root_bytes)).unwrap();
        (backend, barrier, root_bytes)
    }

    #[test]
    fn test_sealed_barrier_refuses_everything() {
        let backend = InmemBackend::new();
        let barrier = Barrier::new(Arc::new(backend.clone()));
        assert!(barrier.is_sealed());
        assert!(matches!(barrier.get("a"), Err(SealvaultError::Sealed)));
        assert!(matches!(barrier.put("a", b"x"), Err(SealvaultError::Sealed)));
        assert!(matches!(barrier.delete("a"), Err(SealvaultError::Sealed)));
        assert!(matches!(barrier.list(""), Err(SealvaultError::Sealed)));
        assert!(matches!(barrier.rotate(), Err(SealvaultError::Sealed)));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_initialize_lays_down_entries_and_companions() {
        let backend = InmemBackend::new();
        let barrier = Barrier::new(Arc::new(backend.clone()));
        let root = crypto::generate_random_key().unwrap();

        // A keyring left by an earlier failed attempt is simply replaced.
        backend.put(KEYRING_PATH, b"stale").unwrap();
        barrier
            .initialize(
                &RootKey::from_bytes(root),
                vec![("core/note".to_string(), b"hello".to_vec())],
                vec![TxnOp::Put { key: "core/plain".into(), value: b"clear".to_vec() }],
            )
            .unwrap();
        assert!(barrier.is_sealed());

        let raw = backend.get("core/note").unwrap().unwrap();
        assert!(!raw.windows(5).any(|w| w == b"hello"));
        assert_eq!(backend.get("core/plain").unwrap().unwrap(), b"clear");

        barrier.unseal(RootKey::from_bytes(root)).unwrap();
        assert_eq!(barrier.get("core/note").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_root_key() {
        let (_backend, barrier, _root) = unsealed();
        barrier.seal();
        let wrong = RootKey::from_bytes([9u8; 32]);
        assert!(matches!(
            barrier.unseal(wrong),
            Err(SealvaultError::AuthenticationFailed)
        ));
        assert!(barrier.is_sealed());
    }

    #[test]
    fn test_ciphertext_is_bound_to_path() {
        let (backend, barrier, _root) = unsealed();
        barrier.put("logical/a", b"alpha").unwrap();
        let raw = backend.get("logical/a").unwrap().unwrap();
        assert!(!raw.windows(5).any(|w| w == b"alpha"));

        backend.put("logical/b", &raw).unwrap();
        assert!(matches!(
            barrier.get("logical/b"),
            Err(SealvaultError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_rotation_keeps_old_entries_readable() {
        let (backend, barrier, root) = unsealed();
        barrier.put("logical/old", b"v1").unwrap();

        assert_eq!(barrier.rotate().unwrap(), 2);
        barrier.put("logical/new", b"v2").unwrap();

        let old = StorageEntry::decode("logical/old", &backend.get("logical/old").unwrap().unwrap()).unwrap();
        let new = StorageEntry::decode("logical/new", &backend.get("logical/new").unwrap().unwrap()).unwrap();
        assert_eq!(old.term, 1);
        assert_eq!(new.term, 2);

        // The rotated keyring survives a seal cycle.
        barrier.seal();
        barrier.unseal(RootKey::from_bytes(root)).unwrap();
        assert_eq!(barrier.key_status().unwrap().term, 2);
        assert_eq!(barrier.get("logical/old").unwrap().unwrap(), b"v1");
        assert_eq!(barrier.get("logical/new").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_retagged_entry_fails() {
        let (backend, barrier, _root) = unsealed();
        barrier.put("logical/a", b"alpha").unwrap();
        barrier.rotate().unwrap();

        let mut raw = backend.get("logical/a").unwrap().unwrap();
        raw[4] = 2;
        backend.put("logical/a", &raw).unwrap();
        assert!(matches!(
            barrier.get("logical/a"),
            Err(SealvaultError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_rekey_swaps_root() {
        let (_backend, barrier, old_root) = unsealed();
        barrier.put("logical/a", b"alpha").unwrap();

        let new_root = crypto::generate_random_key().unwrap();
        barrier
            .rekey(
                RootKey::from_bytes(new_root),
                vec![TxnOp::Put { key: "core/marker".into(), value: b"1".to_vec() }],
            )
            .unwrap();
        barrier.seal();

        assert!(barrier.unseal(RootKey::from_bytes(old_root)).is_err());
        barrier.unseal(RootKey::from_bytes(new_root)).unwrap();
        assert_eq!(barrier.get("logical/a").unwrap().unwrap(), b"alpha");
        assert_eq!(barrier.backend().get("core/marker").unwrap().unwrap(), b"1");
    }

    /// Seals the barrier as soon as the keyring is rewritten.
    struct SealOnKeyringWrite {
        inner: InmemBackend,
        barrier: Mutex<Weak<Barrier>>,
    }

    impl Backend for SealOnKeyringWrite {
        fn name(&self) -> &'static str {
            "seal-on-write"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            self.inner.put(key, value)?;
            if key == KEYRING_PATH {
                if let Some(barrier) = self.barrier.lock().upgrade() {
                    barrier.seal();
                }
            }
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn test_rekey_completes_when_sealed_mid_write() {
        let backend = Arc::new(SealOnKeyringWrite {
            inner: InmemBackend::new(),
            barrier: Mutex::new(Weak::new()),
        });
        let barrier = Arc::new(Barrier::new(backend.clone()));
        let old_root = crypto::generate_random_key().unwrap();
        barrier
            .initialize(&RootKey::from_bytes(old_root), Vec::new(), Vec::new())
            .unwrap();
        barrier.unseal(RootKey::from_bytes(old_root)).unwrap();
        barrier.put("logical/a", b"alpha").unwrap();

        // The stored keyring already belongs to the new root, so the rekey
        // must report success even though the barrier is now sealed.
        *backend.barrier.lock() = Arc::downgrade(&barrier);
        let new_root = crypto::generate_random_key().unwrap();
        barrier.rekey(RootKey::from_bytes(new_root), Vec::new()).unwrap();
        assert!(barrier.is_sealed());

        *backend.barrier.lock() = Weak::new();
        assert!(barrier.unseal(RootKey::from_bytes(old_root)).is_err());
        barrier.unseal(RootKey::from_bytes(new_root)).unwrap();
        assert_eq!(barrier.get("logical/a").unwrap().unwrap(), b"alpha");
    }

    #[test]
    fn test_failed_rekey_restores_old_keyring() {
        let service = LoopbackKv::new();
        let backend = KvBackend::new(Arc::new(service.clone()), "", RetryPolicy::none());
        let barrier = Barrier::new(Arc::new(backend));
        let old_root = crypto::generate_random_key().unwrap();
        barrier
            .initialize(&RootKey::from_bytes(old_root), Vec::new(), Vec::new())
            .unwrap();
        barrier.unseal(RootKey::from_bytes(old_root)).unwrap();
        barrier.put("logical/a", b"alpha").unwrap();

        service.fail_writes_to("core/companion", BackendError::permanent("disk full"));
        let new_root = crypto::generate_random_key().unwrap();
        let companion = TxnOp::Put { key: "core/companion".into(), value: b"1".to_vec() };
        assert!(barrier.rekey(RootKey::from_bytes(new_root), vec![companion]).is_err());

        // Still unsealed under the old keyring, and the old root still opens it.
        assert_eq!(barrier.get("logical/a").unwrap().unwrap(), b"alpha");
        barrier.seal();
        assert!(barrier.unseal(RootKey::from_bytes(new_root)).is_err());
        barrier.unseal(RootKey::from_bytes(old_root)).unwrap();
        assert_eq!(barrier.get("logical/a").unwrap().unwrap(), b"alpha");
    }
}
