//! Typed access to the hierarchical coordination store.
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use slog::Logger;

use super::Error;
use super::ErrorKind;
use super::Result;

mod memory;
mod zookeeper;

pub use self::memory::MemoryStore;
pub use self::zookeeper::ZookeeperStore;

/// Session lifecycle notifications from the store.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SessionEvent {
    Connected,
    Suspended,
    Lost,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Suspended => "suspended",
            SessionEvent::Lost => "lost",
        }
    }
}

/// One operation inside a transactional commit.
#[derive(Clone, Debug, PartialEq)]
pub enum TxOp {
    Create {
        path: String,
        data: Vec<u8>,
        ephemeral: bool,
    },
    Set {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
}

impl TxOp {
    pub fn path(&self) -> &str {
        match self {
            TxOp::Create { path, .. } => path,
            TxOp::Set { path, .. } => path,
            TxOp::Delete { path } => path,
        }
    }
}

/// Per-operation outcome of a transactional commit.
#[derive(Clone, Debug, PartialEq)]
pub enum TxResult {
    Committed,
    RolledBack,
    Failed(String),
}

/// A tree of byte-keyed znodes with ephemeral nodes and transactions.
///
/// Reads of missing nodes are not errors: `get` returns None and
/// `children` an empty list, which keeps enumeration code free of
/// exists-checks racing against deletes.
pub trait Store: Send + Sync {
    fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()>;

    fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn children(&self, path: &str) -> Result<Vec<String>>;

    fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Create the given path (and missing parents) as persistent nodes.
    fn ensure_path(&self, path: &str) -> Result<()>;

    /// Apply every operation or none of them.
    ///
    /// The result list is parallel to `ops`; on failure exactly one entry is
    /// `Failed` and every other entry `RolledBack`.
    fn commit(&self, ops: &[TxOp]) -> Result<Vec<TxResult>>;

    /// Session events, delivered on a bounded queue.
    ///
    /// Consumers drain this from their own thread; events that find the
    /// queue full are dropped.
    fn events(&self) -> Receiver<SessionEvent>;

    fn close(&self);
}

/// Buffered multi-operation commit handle.
pub struct Transaction<'a> {
    ops: Vec<TxOp>,
    store: &'a dyn Store,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn Store) -> Transaction<'a> {
        Transaction {
            ops: Vec::new(),
            store,
        }
    }

    pub fn create<S: Into<String>>(&mut self, path: S, data: Vec<u8>) -> &mut Self {
        self.ops.push(TxOp::Create {
            path: path.into(),
            data,
            ephemeral: false,
        });
        self
    }

    pub fn set<S: Into<String>>(&mut self, path: S, data: Vec<u8>) -> &mut Self {
        self.ops.push(TxOp::Set {
            path: path.into(),
            data,
        });
        self
    }

    pub fn delete<S: Into<String>>(&mut self, path: S) -> &mut Self {
        self.ops.push(TxOp::Delete { path: path.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commit all buffered operations, surfacing the first real failure.
    ///
    /// Rolled-back results are skipped when looking for the error to report.
    pub fn commit(self) -> Result<()> {
        let results = self.store.commit(&self.ops)?;
        for (op, result) in self.ops.iter().zip(results.iter()) {
            if let TxResult::Failed(reason) = result {
                return Err(ErrorKind::Transaction(format!(
                    "{} on {}: {}",
                    op_name(op),
                    op.path(),
                    reason
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn op_name(op: &TxOp) -> &'static str {
    match op {
        TxOp::Create { .. } => "create",
        TxOp::Set { .. } => "set",
        TxOp::Delete { .. } => "delete",
    }
}

/// Connect the store named by the configuration.
pub fn connect(config: &super::Config, logger: Logger) -> Result<Arc<dyn Store>> {
    match config.backend {
        super::BackendConfig::Zookeeper(ref zookeeper) => Ok(Arc::new(ZookeeperStore::new(
            zookeeper.clone(),
            config.retry.clone(),
            logger,
        )?)),
        super::BackendConfig::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Retry an operation with exponential backoff on transient errors.
pub fn with_retry<T, F>(
    logger: &Logger,
    retry: &super::RetryConfig,
    name: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = Duration::from_millis(retry.base_delay_ms);
    let mut last: Option<Error> = None;
    for attempt in 0..retry.attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.kind().is_transient() {
                    return Err(error);
                }
                debug!(
                    logger, "Transient coordination store error";
                    "op" => name, "attempt" => attempt + 1, "error" => %error,
                );
                last = Some(error);
            }
        }
        thread::sleep(delay);
        delay *= 2;
    }
    warn!(logger, "Retry budget exhausted"; "op" => name);
    match last {
        Some(error) => Err(error),
        None => Err(ErrorKind::RetryExhausted(name, retry.attempts).into()),
    }
}

/// Depth-first list of every znode under (and including) `path`.
///
/// Paths come back parents-first; reverse for leaf-first deletes.
pub fn walk(store: &dyn Store, path: &str) -> Result<Vec<String>> {
    let mut found = Vec::new();
    if !store.exists(path)? {
        return Ok(found);
    }
    let mut queue = vec![path.to_string()];
    while let Some(path) = queue.pop() {
        for child in store.children(&path)? {
            queue.push(format!("{}/{}", path, child));
        }
        found.push(path);
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use super::Store;
    use super::Transaction;
    use super::TxResult;

    #[test]
    fn walk_lists_subtree_parents_first() {
        let store = MemoryStore::new();
        store.ensure_path("/a/b/c").unwrap();
        store.ensure_path("/a/d").unwrap();
        let paths = super::walk(&store, "/a").unwrap();
        assert_eq!(paths, vec!["/a", "/a/b", "/a/b/c", "/a/d"]);
    }

    #[test]
    fn walk_missing_root_is_empty() {
        let store = MemoryStore::new();
        assert!(super::walk(&store, "/ghost").unwrap().is_empty());
    }

    #[test]
    fn transaction_reports_first_real_error() {
        let store = MemoryStore::new();
        store.ensure_path("/base").unwrap();
        let mut tx = Transaction::new(&store);
        tx.create("/base/one", b"1".to_vec());
        tx.create("/missing/parent/child", b"2".to_vec());
        let error = tx.commit().unwrap_err();
        let display = error.to_string();
        assert!(display.contains("/missing/parent/child"), "{}", display);
        // Nothing was applied.
        assert!(!store.exists("/base/one").unwrap());
    }

    #[test]
    fn commit_results_parallel_to_ops() {
        let store = MemoryStore::new();
        store.ensure_path("/base").unwrap();
        let ops = vec![
            super::TxOp::Create {
                path: "/base/one".into(),
                data: Vec::new(),
                ephemeral: false,
            },
            super::TxOp::Set {
                path: "/base/ghost".into(),
                data: Vec::new(),
            },
        ];
        let results = store.commit(&ops).unwrap();
        assert_eq!(results[0], TxResult::RolledBack);
        match results[1] {
            TxResult::Failed(_) => (),
            ref result => panic!("unexpected result: {:?}", result),
        };
    }
}
