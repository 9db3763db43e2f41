// In-process index engine. The production engine keeps bitmaps per verb and
// stream on whatever storage tier the partition lives on; this one keeps
// every partition as a sorted vector, which is all the stock plugins and the
// demo need.

use std::ops::ControlFlow;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::partition::{PartitionId, TenantId};
use crate::plugin::IndexEngine;
use crate::tracking::{ReadState, ReadStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("activity {0} has no stream")]
    MissingStream(u64),
    #[error("index engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: u64,
    pub stream_id: String,
    pub verb: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

impl Activity {
    pub fn new(
        activity_id: u64,
        stream_id: impl Into<String>,
        verb: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            activity_id,
            stream_id: stream_id.into(),
            verb: verb.into(),
            timestamp,
        }
    }
}

/// One partition's activities, oldest first.
#[derive(Default)]
pub struct PartitionIndex {
    activities: RwLock<Vec<Activity>>,
}

impl PartitionIndex {
    pub fn len(&self) -> usize {
        self.activities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.read().is_empty()
    }

    /// Visits activities the authorization allows, newest first, until `f`
    /// breaks. An empty authorization sees everything; otherwise only streams
    /// starting with it.
    pub fn scan<F>(&self, authorization: &str, mut f: F)
    where
        F: FnMut(&Activity) -> ControlFlow<()>,
    {
        let activities = self.activities.read();
        for activity in activities.iter().rev() {
            if !activity.stream_id.starts_with(authorization) {
                continue;
            }
            if f(activity).is_break() {
                break;
            }
        }
    }

    /// Merges a batch in. An activity seen again replaces its earlier copy,
    /// whatever its timestamp.
    fn append(&self, batch: Vec<Activity>) {
        let mut activities = self.activities.write();
        let mut by_id: HashMap<u64, Activity> = activities
            .drain(..)
            .map(|a| (a.activity_id, a))
            .collect();
        by_id.extend(batch.into_iter().map(|a| (a.activity_id, a)));
        activities.extend(by_id.into_values());
        activities.sort_by_key(|a| (a.timestamp, a.activity_id));
    }
}

#[derive(Default)]
pub struct MemoryEngine {
    partitions: RwLock<HashMap<(TenantId, PartitionId), Arc<PartitionIndex>>>,
    reads: Mutex<HashMap<(TenantId, String), ReadState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partitions(&self, tenant: &TenantId) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .partitions
            .read()
            .keys()
            .filter(|(t, _)| t == tenant)
            .map(|(_, p)| *p)
            .collect();
        partitions.sort_unstable();
        partitions
    }
}

impl IndexEngine for MemoryEngine {
    type Activity = Activity;
    type Handle = PartitionIndex;

    fn handle(&self, tenant: &TenantId, partition: PartitionId) -> Option<Arc<PartitionIndex>> {
        self.partitions
            .read()
            .get(&(tenant.clone(), partition))
            .cloned()
    }

    fn index(
        &self,
        tenant: &TenantId,
        partition: PartitionId,
        activities: Vec<Activity>,
    ) -> Result<usize, EngineError> {
        if let Some(bad) = activities.iter().find(|a| a.stream_id.is_empty()) {
            return Err(EngineError::MissingStream(bad.activity_id));
        }
        let count = activities.len();
        let index = self
            .partitions
            .write()
            .entry((tenant.clone(), partition))
            .or_default()
            .clone();
        index.append(activities);
        debug!(%tenant, %partition, count, "indexed activities");
        Ok(count)
    }

    fn drop_partition(&self, tenant: &TenantId, partition: PartitionId) -> bool {
        self.partitions
            .write()
            .remove(&(tenant.clone(), partition))
            .is_some()
    }
}

impl ReadStore for MemoryEngine {
    fn load(&self, tenant: &TenantId, stream: &str) -> ReadState {
        self.reads
            .lock()
            .get(&(tenant.clone(), stream.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, tenant: &TenantId, stream: &str, state: ReadState) {
        self.reads
            .lock()
            .insert((tenant.clone(), stream.to_owned()), state);
    }

    fn activities(&self, tenant: &TenantId, stream: &str) -> Vec<(u64, i64)> {
        let handles: Vec<Arc<PartitionIndex>> = self
            .partitions
            .read()
            .iter()
            .filter(|((t, _), _)| t == tenant)
            .map(|(_, index)| index.clone())
            .collect();
        let mut found = Vec::new();
        for index in handles {
            index.scan(stream, |activity| {
                if activity.stream_id == stream {
                    found.push((activity.activity_id, activity.timestamp));
                }
                ControlFlow::Continue(())
            });
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_newest_first_and_filtered() {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        engine
            .index(
                &tenant,
                PartitionId(0),
                vec![
                    Activity::new(1, "team/a", "click", 10),
                    Activity::new(3, "other/b", "click", 30),
                    Activity::new(2, "team/c", "view", 20),
                ],
            )
            .unwrap();
        let index = engine.handle(&tenant, PartitionId(0)).unwrap();

        let mut seen = Vec::new();
        index.scan("team/", |a| {
            seen.push(a.activity_id);
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec![2, 1]);

        let mut first = None;
        index.scan("", |a| {
            first = Some(a.activity_id);
            ControlFlow::Break(())
        });
        assert_eq!(first, Some(3));
    }

    #[test]
    fn rejects_activities_without_a_stream() {
        let engine = MemoryEngine::new();
        let err = engine
            .index(
                &TenantId::from("acme"),
                PartitionId(0),
                vec![Activity::new(9, "", "click", 1)],
            )
            .unwrap_err();
        assert_eq!(err, EngineError::MissingStream(9));
        assert!(engine.partitions(&TenantId::from("acme")).is_empty());
    }

    #[test]
    fn reindexing_the_same_activity_is_idempotent() {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        let batch = vec![Activity::new(1, "s", "click", 10)];
        engine.index(&tenant, PartitionId(2), batch.clone()).unwrap();
        engine.index(&tenant, PartitionId(2), batch).unwrap();
        assert_eq!(engine.handle(&tenant, PartitionId(2)).unwrap().len(), 1);
        assert!(engine.drop_partition(&tenant, PartitionId(2)));
        assert!(engine.handle(&tenant, PartitionId(2)).is_none());
    }

    #[test]
    fn resent_activity_replaces_its_earlier_copy() {
        let engine = MemoryEngine::new();
        let tenant = TenantId::from("acme");
        engine
            .index(
                &tenant,
                PartitionId(0),
                vec![Activity::new(1, "s", "click", 10), Activity::new(2, "s", "view", 20)],
            )
            .unwrap();
        engine
            .index(&tenant, PartitionId(0), vec![Activity::new(1, "s", "share", 30)])
            .unwrap();

        let index = engine.handle(&tenant, PartitionId(0)).unwrap();
        assert_eq!(index.len(), 2);
        let mut seen = Vec::new();
        index.scan("", |a| {
            seen.push((a.activity_id, a.verb.clone(), a.timestamp));
            ControlFlow::Continue(())
        });
        assert_eq!(
            seen,
            vec![(1, "share".to_string(), 30), (2, "view".to_string(), 20)]
        );
    }
}
