use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use super::super::ErrorKind;
use super::super::Result;
use super::SessionEvent;
use super::Store;
use super::TxOp;
use super::TxResult;

const EVENTS_QUEUE_SIZE: usize = 16;

/// Process-local store for development clusters and tests.
///
/// Implements the full `Store` contract, including ephemeral nodes tied to a
/// simulated session: `session_drop` removes them and emits a Lost event the
/// way an expired coordination session would.
pub struct MemoryStore {
    tree: Mutex<BTreeMap<String, Znode>>,
    events_tx: Mutex<Option<Sender<SessionEvent>>>,
    events_rx: Receiver<SessionEvent>,
}

#[derive(Clone, Debug)]
struct Znode {
    data: Vec<u8>,
    ephemeral: bool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        let (events_tx, events_rx) = bounded(EVENTS_QUEUE_SIZE);
        let _ = events_tx.try_send(SessionEvent::Connected);
        MemoryStore {
            tree: Mutex::new(BTreeMap::new()),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx,
        }
    }

    /// Simulate losing the session: every ephemeral node vanishes.
    pub fn session_drop(&self) {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        tree.retain(|_, znode| !znode.ephemeral);
        self.emit(SessionEvent::Lost);
    }

    /// Simulate a transient disconnection.
    pub fn session_suspend(&self) {
        self.emit(SessionEvent::Suspended);
    }

    fn emit(&self, event: SessionEvent) {
        let sender = self
            .events_tx
            .lock()
            .expect("MemoryStore::events_tx lock poisoned");
        if let Some(ref sender) = *sender {
            let _ = sender.try_send(event);
        }
    }

    fn parent(path: &str) -> Option<String> {
        let parent = match path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(index) => path[..index].to_string(),
            None => return None,
        };
        Some(parent)
    }

    fn has_parent(tree: &BTreeMap<String, Znode>, path: &str) -> bool {
        match MemoryStore::parent(path) {
            Some(ref parent) if parent == "/" => true,
            Some(ref parent) => tree.contains_key(parent),
            None => false,
        }
    }

    fn children_of(tree: &BTreeMap<String, Znode>, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        tree.range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    fn apply(
        tree: &mut BTreeMap<String, Znode>,
        op: &TxOp,
    ) -> ::std::result::Result<(), String> {
        match op {
            TxOp::Create {
                path,
                data,
                ephemeral,
            } => {
                if tree.contains_key(path) {
                    return Err("node already exists".into());
                }
                if !MemoryStore::has_parent(tree, path) {
                    return Err("parent node does not exist".into());
                }
                tree.insert(
                    path.clone(),
                    Znode {
                        data: data.clone(),
                        ephemeral: *ephemeral,
                    },
                );
                Ok(())
            }
            TxOp::Set { path, data } => match tree.get_mut(path) {
                Some(znode) => {
                    znode.data = data.clone();
                    Ok(())
                }
                None => Err("node does not exist".into()),
            },
            TxOp::Delete { path } => {
                if !tree.contains_key(path) {
                    return Err("node does not exist".into());
                }
                if !MemoryStore::children_of(tree, path).is_empty() {
                    return Err("node has children".into());
                }
                tree.remove(path);
                Ok(())
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl Store for MemoryStore {
    fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()> {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        if tree.contains_key(path) {
            return Err(ErrorKind::AlreadyExists(path.to_string()).into());
        }
        if !MemoryStore::has_parent(&tree, path) {
            return Err(ErrorKind::Backend("create").into());
        }
        tree.insert(
            path.to_string(),
            Znode {
                data: data.to_vec(),
                ephemeral,
            },
        );
        Ok(())
    }

    fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        match tree.get_mut(path) {
            Some(znode) => {
                znode.data = data.to_vec();
                Ok(())
            }
            None => Err(ErrorKind::Backend("set").into()),
        }
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        Ok(tree.get(path).map(|znode| znode.data.clone()))
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        Ok(MemoryStore::children_of(&tree, path))
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        if !tree.contains_key(path) {
            return Ok(());
        }
        let children = MemoryStore::children_of(&tree, path);
        if !children.is_empty() && !recursive {
            return Err(ErrorKind::Backend("delete").into());
        }
        let prefix = format!("{}/", path);
        tree.retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        Ok(path == "/" || tree.contains_key(path))
    }

    fn ensure_path(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            tree.entry(current.clone()).or_insert_with(|| Znode {
                data: Vec::new(),
                ephemeral: false,
            });
        }
        Ok(())
    }

    fn commit(&self, ops: &[TxOp]) -> Result<Vec<TxResult>> {
        let mut tree = self.tree.lock().expect("MemoryStore::tree lock poisoned");
        // Validate against a scratch copy; swap it in only if every op works.
        let mut scratch = tree.clone();
        let mut failure: Option<(usize, String)> = None;
        for (index, op) in ops.iter().enumerate() {
            if let Err(reason) = MemoryStore::apply(&mut scratch, op) {
                failure = Some((index, reason));
                break;
            }
        }
        match failure {
            None => {
                *tree = scratch;
                Ok(ops.iter().map(|_| TxResult::Committed).collect())
            }
            Some((failed, reason)) => Ok(ops
                .iter()
                .enumerate()
                .map(|(index, _)| {
                    if index == failed {
                        TxResult::Failed(reason.clone())
                    } else {
                        TxResult::RolledBack
                    }
                })
                .collect()),
        }
    }

    fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        let mut sender = self
            .events_tx
            .lock()
            .expect("MemoryStore::events_tx lock poisoned");
        sender.take();
    }
}

#[cfg(test)]
mod tests {
    use super::SessionEvent;
    use super::Store;
    use super::MemoryStore;

    #[test]
    fn create_get_set_delete() {
        let store = MemoryStore::new();
        store.ensure_path("/base").unwrap();
        store.create("/base/node", b"v1", false).unwrap();
        assert_eq!(store.get("/base/node").unwrap().unwrap(), b"v1");
        store.set("/base/node", b"v2").unwrap();
        assert_eq!(store.get("/base/node").unwrap().unwrap(), b"v2");
        store.delete("/base/node", false).unwrap();
        assert!(store.get("/base/node").unwrap().is_none());
    }

    #[test]
    fn create_requires_parent() {
        let store = MemoryStore::new();
        assert!(store.create("/missing/node", b"", false).is_err());
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let store = MemoryStore::new();
        store.ensure_path("/base").unwrap();
        store.create("/base/node", b"", false).unwrap();
        match store.create("/base/node", b"", false) {
            Err(error) => match error.kind() {
                super::super::super::ErrorKind::AlreadyExists(path) => {
                    assert_eq!(path, "/base/node")
                }
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("expected create to fail"),
        };
    }

    #[test]
    fn children_are_direct_only() {
        let store = MemoryStore::new();
        store.ensure_path("/base/a/deep").unwrap();
        store.ensure_path("/base/b").unwrap();
        assert_eq!(store.children("/base").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn recursive_delete() {
        let store = MemoryStore::new();
        store.ensure_path("/base/a/deep").unwrap();
        assert!(store.delete("/base", false).is_err());
        store.delete("/base", true).unwrap();
        assert!(!store.exists("/base").unwrap());
    }

    #[test]
    fn session_drop_removes_ephemerals() {
        let store = MemoryStore::new();
        store.ensure_path("/live").unwrap();
        store.create("/live/n1:50051", b"", true).unwrap();
        store.create("/live/keep", b"", false).unwrap();
        let events = store.events();
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Connected);
        store.session_drop();
        assert!(!store.exists("/live/n1:50051").unwrap());
        assert!(store.exists("/live/keep").unwrap());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Lost);
    }
}
