use std::collections::HashMap;

use crate::protocol::ExchangeId;

/// Per-exchange user data kept outside the exchange itself.
///
/// Handlers that need to attach state to a [`Request`](crate::Request) or
/// [`WsRequest`](crate::WsRequest) key it by the exchange's [`ExchangeId`]
/// and remove it once the exchange is done.
#[derive(Debug)]
pub struct SideTable<V> {
    entries: HashMap<ExchangeId, V>,
}

impl<V> Default for SideTable<V> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<V> SideTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ExchangeId, value: V) -> Option<V> {
        self.entries.insert(id, value)
    }

    pub fn get(&self, id: ExchangeId) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ExchangeId) -> Option<&mut V> {
        self.entries.get_mut(&id)
    }

    pub fn get_or_insert_with<F: FnOnce() -> V>(&mut self, id: ExchangeId, init: F) -> &mut V {
        self.entries.entry(id).or_insert_with(init)
    }

    pub fn remove(&mut self, id: ExchangeId) -> Option<V> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ExchangeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
