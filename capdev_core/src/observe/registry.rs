use crate::coap::option::OBSERVE_SEQUENCE_MASK;
use crate::resource::Request;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Identifies one observation: the peer and the token it registered with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverKey {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
}

impl ObserverKey {
    pub fn new(peer: SocketAddr, token: Vec<u8>) -> Self {
        Self { peer, token }
    }
}

#[derive(Debug, Clone)]
struct Observer {
    // Kept so every notification re-runs the same authorization
    request: Request,
    sequence: u32,
    last_message_id: Option<u16>,
}

/// Observer bookkeeping per resource path.
///
/// Mutating operations return the resulting observer count of the affected
/// path so the caller can forward it to the resource.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    paths: HashMap<String, HashMap<ObserverKey, Observer>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh an observation. Returns `(count, sequence)`.
    pub fn register(&mut self, path: &str, key: ObserverKey, request: Request) -> (usize, u32) {
        let observers = self.paths.entry(path.to_string()).or_default();
        let observer = observers.entry(key).or_insert_with(|| Observer {
            request: request.clone(),
            sequence: 0,
            last_message_id: None,
        });
        observer.request = request;
        let sequence = observer.sequence;
        (observers.len(), sequence)
    }

    /// Remove an observation. Returns the new count if it existed.
    pub fn deregister(&mut self, path: &str, key: &ObserverKey) -> Option<usize> {
        let observers = self.paths.get_mut(path)?;
        observers.remove(key)?;
        let count = observers.len();
        if count == 0 {
            self.paths.remove(path);
        }
        Some(count)
    }

    /// Remove the observation whose latest notification used `message_id`
    /// (a peer answering a notification with RST). Returns `(path, count)`.
    pub fn deregister_by_message_id(
        &mut self,
        peer: SocketAddr,
        message_id: u16,
    ) -> Option<(String, usize)> {
        let (path, key) = self.paths.iter().find_map(|(path, observers)| {
            observers
                .iter()
                .find(|(key, observer)| {
                    key.peer == peer && observer.last_message_id == Some(message_id)
                })
                .map(|(key, _)| (path.clone(), key.clone()))
        })?;

        self.deregister(&path, &key).map(|count| (path, count))
    }

    pub fn count(&self, path: &str) -> usize {
        self.paths.get(path).map_or(0, HashMap::len)
    }

    pub fn contains(&self, path: &str, key: &ObserverKey) -> bool {
        self.paths
            .get(path)
            .is_some_and(|observers| observers.contains_key(key))
    }

    /// Observers of `path` with the request each registered with
    pub fn observers(&self, path: &str) -> Vec<(ObserverKey, Request)> {
        self.paths
            .get(path)
            .map(|observers| {
                observers
                    .iter()
                    .map(|(key, observer)| (key.clone(), observer.request.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Advance the Observe sequence of one observer and remember the message
    /// id its notification goes out with
    pub fn next_sequence(&mut self, path: &str, key: &ObserverKey, message_id: u16) -> Option<u32> {
        let observer = self.paths.get_mut(path)?.get_mut(key)?;
        observer.sequence = (observer.sequence + 1) & OBSERVE_SEQUENCE_MASK;
        observer.last_message_id = Some(message_id);
        Some(observer.sequence)
    }
}
