use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use super::Credentials;
use super::HttpSearcherClient;
use super::Result;
use super::SearcherClient;

/// Factory building one client for a `(hostport, credentials)` pair.
pub type ClientFactory<C> =
    Box<dyn Fn(&str, &Credentials) -> Result<Arc<C>> + Send + Sync>;

/// Per-endpoint singleton clients keyed by `"hostport|credentials"`.
///
/// The first access for a key builds the client under the write lock;
/// subsequent accesses share the same instance through the read path. The
/// pool is injected into components so it outlives any individual request.
pub struct ClientPool<C: ?Sized> {
    clients: RwLock<HashMap<String, Arc<C>>>,
    factory: ClientFactory<C>,
}

impl<C: ?Sized> ClientPool<C> {
    pub fn new(factory: ClientFactory<C>) -> ClientPool<C> {
        ClientPool {
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub fn get(&self, hostport: &str, credentials: &Credentials) -> Result<Arc<C>> {
        let key = format!("{}|{}", hostport, credentials.cache_key());
        {
            let clients = self.clients.read().expect("client pool lock poisoned");
            if let Some(client) = clients.get(&key) {
                return Ok(Arc::clone(client));
            }
        }
        let mut clients = self.clients.write().expect("client pool lock poisoned");
        // Lost the race? Reuse whatever the winner inserted.
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }
        let client = (self.factory)(hostport, credentials)?;
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    pub fn len(&self) -> usize {
        let clients = self.clients.read().expect("client pool lock poisoned");
        clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool of searcher clients, the flavour the merger fans out with.
pub type SearcherPool = ClientPool<dyn SearcherClient>;

impl SearcherPool {
    /// Pool producing HTTP searcher clients with the given request timeout.
    pub fn http(timeout: Duration) -> SearcherPool {
        ClientPool::new(Box::new(move |hostport, credentials| {
            let client = HttpSearcherClient::new(hostport, credentials, timeout)?;
            Ok(Arc::new(client) as Arc<dyn SearcherClient>)
        }))
    }
}
