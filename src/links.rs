//! One-time download links
//!
//! A front end prepares a download, parks it here under a random id and hands
//! the id out as a link. The first request for the id takes the value; every
//! later request finds nothing.

use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

pub struct LinkTable<T> {
    links: Mutex<HashMap<String, T>>,
}

impl<T> LinkTable<T> {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Park `value` and return its id.
    pub fn insert(&self, value: T) -> String {
        let id = Uuid::new_v4().to_string();
        self.links.lock().insert(id.clone(), value);
        id
    }

    /// Load and remove in one step.
    pub fn take(&self, id: &str) -> Option<T> {
        self.links.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.links.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

impl<T> Default for LinkTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// URL path under which a link is served
pub fn link_path(id: &str) -> String {
    format!("/file/{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn a_link_is_served_once() {
        let table = LinkTable::new();
        let id = table.insert("payload");
        assert!(table.contains(&id));
        assert_eq!(link_path(&id), format!("/file/{id}"));
        assert_eq!(table.take(&id), Some("payload"));
        assert_eq!(table.take(&id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_takers_get_it_at_most_once() {
        let table = Arc::new(LinkTable::new());
        let id = table.insert(7u32);
        let winners: usize = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let id = id.clone();
                thread::spawn(move || table.take(&id).is_some())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
