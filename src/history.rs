//! Per-entity chronological index.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::event::Event;

/// Read-only `entity_key -> events ascending by timestamp` mapping.
///
/// Events sharing a timestamp keep their submission order, so in query
/// output (most recent first) the later-submitted one ranks ahead. Queries
/// are strict (`timestamp < before`), so same-timestamp siblings never see
/// each other as history.
#[derive(Debug, Clone, Default)]
pub struct EntityHistoryIndex<'a> {
    groups: HashMap<&'a str, Vec<&'a Event>>,
    event_count: usize,
}

impl<'a> EntityHistoryIndex<'a> {
    pub fn build<I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut groups: HashMap<&'a str, Vec<&'a Event>> = HashMap::new();
        let mut event_count = 0usize;
        for event in events {
            groups
                .entry(event.entity_key.as_str())
                .or_default()
                .push(event);
            event_count += 1;
        }

        // sort_by_key is stable
        for group in groups.values_mut() {
            group.sort_by_key(|event| event.timestamp);
        }

        debug!(
            component = "history",
            event = "lag.index.built",
            entity_count = groups.len(),
            event_count = event_count
        );

        Self {
            groups,
            event_count,
        }
    }

    /// Indexes only the entities that [`partition_of`] assigns to `partition`.
    pub fn build_partition<I>(events: I, partition: usize, partitions: usize) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        Self::build(
            events
                .into_iter()
                .filter(|event| partition_of(&event.entity_key, partitions) == partition),
        )
    }

    /// Up to `count` events of `entity_key` strictly before `before`,
    /// most recent first.
    pub fn query(&self, entity_key: &str, before: NaiveDateTime, count: usize) -> Vec<&'a Event> {
        let Some(group) = self.groups.get(entity_key) else {
            return Vec::new();
        };
        let end = group.partition_point(|event| event.timestamp < before);
        group[..end].iter().rev().take(count).copied().collect()
    }

    pub fn history(&self, entity_key: &str) -> &[&'a Event] {
        self.groups
            .get(entity_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity_count(&self) -> usize {
        self.groups.len()
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }
}

/// Stable partition assignment for an entity key, identical across runs and
/// platforms.
pub fn partition_of(entity_key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(entity_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as usize
}
