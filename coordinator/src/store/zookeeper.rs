use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use failure::ResultExt;
use slog::Logger;

use zookeeper::Acl;
use zookeeper::CreateMode;
use zookeeper::ZkError;
use zookeeper::ZkResult;
use zookeeper::ZkState;
use zookeeper::ZooKeeper;

use super::super::metrics::STORE_OP_DURATION;
use super::super::metrics::STORE_OP_ERRORS_COUNT;
use super::super::metrics::STORE_TX_ROLLBACK_COUNT;
use super::super::ErrorKind;
use super::super::Result;
use super::super::RetryConfig;
use super::super::ZookeeperConfig;
use super::with_retry;
use super::SessionEvent;
use super::Store;
use super::TxOp;
use super::TxResult;

const EVENTS_QUEUE_SIZE: usize = 16;

/// Zookeeper-backed coordination store.
///
/// Holds one session at a time and transparently starts a new one when the
/// current session closes. The wire protocol exposed by the client has no
/// multi-op request, so `commit` applies operations in order and undoes the
/// applied prefix when one fails.
pub struct ZookeeperStore {
    config: ZookeeperConfig,
    retry: RetryConfig,
    keeper: Mutex<Option<CurrentClient>>,
    logger: Logger,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl ZookeeperStore {
    pub fn new(
        config: ZookeeperConfig,
        retry: RetryConfig,
        logger: Logger,
    ) -> Result<ZookeeperStore> {
        let (events_tx, events_rx) = bounded(EVENTS_QUEUE_SIZE);
        let store = ZookeeperStore {
            config,
            retry,
            keeper: Mutex::new(None),
            logger,
            events_tx,
            events_rx,
        };
        // Connect eagerly so misconfiguration fails startup, not traffic.
        store.client()?;
        Ok(store)
    }

    /// Return the current zookeeper session, starting a new one if needed.
    fn client(&self) -> Result<Arc<ZooKeeper>> {
        let mut current = self.keeper.lock().expect("zookeeper client lock poisoned");
        let active = current
            .as_ref()
            .map(CurrentClient::active)
            .unwrap_or(false);
        if !active {
            *current = Some(self.new_client()?);
        }
        Ok(current.as_ref().expect("client must be set").client())
    }

    fn new_client(&self) -> Result<CurrentClient> {
        info!(self.logger, "Initiating new zookeeper session");
        let timeout = Duration::from_secs(self.config.timeout);
        let keeper = {
            let _timer = STORE_OP_DURATION.with_label_values(&["connect"]).start_timer();
            ZooKeeper::connect(&self.config.ensemble, timeout, |_| {})
                .map_err(|error| {
                    STORE_OP_ERRORS_COUNT.with_label_values(&["connect"]).inc();
                    error
                })
                .with_context(|_| ErrorKind::BackendConnect)?
        };

        // Listen for connection events to clear the session and notify the
        // manager's consumer thread.
        let logger = self.logger.clone();
        let active = Arc::new(AtomicBool::new(true));
        let notify_close = Arc::clone(&active);
        let events = self.events_tx.clone();
        keeper.add_listener(move |state| {
            let (reset, event) = match state {
                ZkState::AuthFailed => {
                    error!(logger, "Zookeeper authentication error");
                    (false, None)
                }
                ZkState::Closed => {
                    warn!(logger, "Zookeeper session closed");
                    (true, Some(SessionEvent::Lost))
                }
                ZkState::Connected => {
                    info!(logger, "Zookeeper connection established");
                    (false, Some(SessionEvent::Connected))
                }
                ZkState::ConnectedReadOnly => {
                    warn!(logger, "Zookeeper connection is read-only");
                    (false, Some(SessionEvent::Connected))
                }
                ZkState::Connecting => {
                    debug!(logger, "Zookeeper session connecting");
                    (false, Some(SessionEvent::Suspended))
                }
                event => {
                    trace!(logger, "Ignoring zookeeper state event"; "event" => ?event);
                    (false, None)
                }
            };
            if let Some(event) = event {
                // Bounded queue; drop events instead of blocking the
                // client's callback thread.
                let _ = events.try_send(event);
            }
            if reset {
                notify_close.store(false, Ordering::Relaxed);
            }
        });

        Ok(CurrentClient {
            active,
            keeper: Arc::new(keeper),
        })
    }

    /// Undo an applied operation while rolling back a failed commit.
    fn undo(&self, undo: Undo) -> Result<()> {
        match undo {
            Undo::Delete { path } => self.delete(&path, false),
            Undo::Restore { path, data } => self.set(&path, &data),
            Undo::Recreate { path, data } => self.create(&path, &data, false),
        }
    }

    fn apply(&self, op: &TxOp) -> Result<Option<Undo>> {
        match op {
            TxOp::Create {
                path,
                data,
                ephemeral,
            } => {
                self.create(path, data, *ephemeral)?;
                Ok(Some(Undo::Delete { path: path.clone() }))
            }
            TxOp::Set { path, data } => {
                let previous = self
                    .get(path)?
                    .ok_or_else(|| ErrorKind::Backend("transaction set"))?;
                self.set(path, data)?;
                Ok(Some(Undo::Restore {
                    path: path.clone(),
                    data: previous,
                }))
            }
            TxOp::Delete { path } => {
                let previous = self
                    .get(path)?
                    .ok_or_else(|| ErrorKind::Backend("transaction delete"))?;
                self.delete(path, false)?;
                Ok(Some(Undo::Recreate {
                    path: path.clone(),
                    data: previous,
                }))
            }
        }
    }
}

enum Undo {
    Delete { path: String },
    Restore { path: String, data: Vec<u8> },
    Recreate { path: String, data: Vec<u8> },
}

impl Store for ZookeeperStore {
    fn create(&self, path: &str, data: &[u8], ephemeral: bool) -> Result<()> {
        with_retry(&self.logger, &self.retry, "create", || {
            let keeper = self.client()?;
            let mode = if ephemeral {
                CreateMode::Ephemeral
            } else {
                CreateMode::Persistent
            };
            let result = observe("create", || {
                keeper.create(path, data.to_vec(), Acl::open_unsafe().clone(), mode)
            });
            match result {
                Ok(_) => Ok(()),
                Err(ZkError::NodeExists) => {
                    Err(ErrorKind::AlreadyExists(path.to_string()).into())
                }
                Err(error) => Err(zk_error("create", error)),
            }
        })
    }

    fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        with_retry(&self.logger, &self.retry, "set", || {
            let keeper = self.client()?;
            match observe("set", || keeper.set_data(path, data.to_vec(), None)) {
                Ok(_) => Ok(()),
                Err(error) => Err(zk_error("set", error)),
            }
        })
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        with_retry(&self.logger, &self.retry, "get", || {
            let keeper = self.client()?;
            match observe("get", || keeper.get_data(path, false)) {
                Ok((data, _)) => Ok(Some(data)),
                Err(ZkError::NoNode) => Ok(None),
                Err(error) => Err(zk_error("get", error)),
            }
        })
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        with_retry(&self.logger, &self.retry, "children", || {
            let keeper = self.client()?;
            match observe("children", || keeper.get_children(path, false)) {
                Ok(mut children) => {
                    children.sort();
                    Ok(children)
                }
                Err(ZkError::NoNode) => Ok(Vec::new()),
                Err(error) => Err(zk_error("children", error)),
            }
        })
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            for child in self.children(path)? {
                self.delete(&format!("{}/{}", path, child), true)?;
            }
        }
        with_retry(&self.logger, &self.retry, "delete", || {
            let keeper = self.client()?;
            match observe("delete", || keeper.delete(path, None)) {
                Ok(()) | Err(ZkError::NoNode) => Ok(()),
                Err(error) => Err(zk_error("delete", error)),
            }
        })
    }

    fn exists(&self, path: &str) -> Result<bool> {
        with_retry(&self.logger, &self.retry, "exists", || {
            let keeper = self.client()?;
            match observe("exists", || keeper.exists(path, false)) {
                Ok(stat) => Ok(stat.is_some()),
                Err(error) => Err(zk_error("exists", error)),
            }
        })
    }

    fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, b"", false) {
                Ok(()) => (),
                Err(ref error) if error.kind().is_already_exists() => (),
                Err(error) => return Err(error),
            };
        }
        Ok(())
    }

    fn commit(&self, ops: &[TxOp]) -> Result<Vec<TxResult>> {
        let mut results: Vec<TxResult> = ops.iter().map(|_| TxResult::RolledBack).collect();
        let mut applied: Vec<Undo> = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            match self.apply(op) {
                Ok(Some(undo)) => applied.push(undo),
                Ok(None) => (),
                Err(error) => {
                    STORE_TX_ROLLBACK_COUNT.with_label_values(&["commit"]).inc();
                    results[index] = TxResult::Failed(error.to_string());
                    for undo in applied.into_iter().rev() {
                        if let Err(error) = self.undo(undo) {
                            error!(
                                self.logger, "Failed to roll back transaction operation";
                                "error" => %error,
                            );
                        }
                    }
                    return Ok(results);
                }
            }
        }
        for result in results.iter_mut() {
            *result = TxResult::Committed;
        }
        Ok(results)
    }

    fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    fn close(&self) {
        let mut current = self.keeper.lock().expect("zookeeper client lock poisoned");
        if let Some(current) = current.take() {
            if let Err(error) = current.keeper.close() {
                warn!(self.logger, "Failed to close zookeeper session"; "error" => ?error);
            }
        }
    }
}

/// Track op durations and error counts around a zookeeper call.
fn observe<T, F>(op: &str, call: F) -> ZkResult<T>
where
    F: FnOnce() -> ZkResult<T>,
{
    let _timer = STORE_OP_DURATION.with_label_values(&[op]).start_timer();
    call().map_err(|error| {
        STORE_OP_ERRORS_COUNT.with_label_values(&[op]).inc();
        error
    })
}

fn zk_error(op: &'static str, error: ZkError) -> super::super::Error {
    match error {
        ZkError::ConnectionLoss | ZkError::OperationTimeout => ErrorKind::Transient(op).into(),
        ZkError::SessionExpired => ErrorKind::SessionExpired.into(),
        _ => ErrorKind::Backend(op).into(),
    }
}

/// Holder of the current zookeeper client with its `active` flag.
struct CurrentClient {
    active: Arc<AtomicBool>,
    keeper: Arc<ZooKeeper>,
}

impl CurrentClient {
    fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn client(&self) -> Arc<ZooKeeper> {
        Arc::clone(&self.keeper)
    }
}
