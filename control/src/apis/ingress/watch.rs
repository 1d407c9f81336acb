//! Watch event classification
//!
//! `kube::runtime::watcher` reports applies without saying whether the object
//! is new, and a re-list after a disconnect only re-applies what still
//! exists. The classifier remembers which keys it has seen so it can emit
//! Add/Update/Delete and synthesize deletes for objects that vanished while
//! the watch was down.

use crate::apis::cluster::WatchEvent;
use common::{EventKind, ResourceKey};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct WatchClassifier {
    seen: HashSet<ResourceKey>,
    /// Keys re-applied during an in-progress re-list
    relisted: Option<HashSet<ResourceKey>>,
}

impl WatchClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify<K>(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent>
    where
        K: Resource,
    {
        match event {
            watcher::Event::Apply(obj) => vec![self.applied(key_of(&obj))],
            watcher::Event::Delete(obj) => {
                let key = key_of(&obj);
                self.seen.remove(&key);
                vec![WatchEvent::new(EventKind::Delete, key)]
            }
            watcher::Event::Init => {
                debug!("Watch re-list started");
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = key_of(&obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                vec![self.applied(key)]
            }
            watcher::Event::InitDone => {
                let relisted = self.relisted.take().unwrap_or_default();
                let mut vanished: Vec<ResourceKey> =
                    self.seen.difference(&relisted).cloned().collect();
                vanished.sort();
                for key in &vanished {
                    self.seen.remove(key);
                }
                debug!(vanished = vanished.len(), "Watch re-list complete");
                vanished
                    .into_iter()
                    .map(|key| WatchEvent::new(EventKind::Delete, key))
                    .collect()
            }
        }
    }

    fn applied(&mut self, key: ResourceKey) -> WatchEvent {
        let kind = if self.seen.insert(key.clone()) {
            EventKind::Add
        } else {
            EventKind::Update
        };
        WatchEvent::new(kind, key)
    }
}

pub fn key_of<K: Resource>(obj: &K) -> ResourceKey {
    ResourceKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}
