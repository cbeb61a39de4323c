use crate::ResolverError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use osacct_core::{AccountEvent, DataSourceId, InstanceType, ObjectId, OsAccount, OsAccountInstance};
use osacct_storage::{instances, CaseTransaction, Connection};
use std::sync::Arc;
use tracing::debug;

/// Most significant committed instance per (account, data source).
///
/// Shared by every worker. Entries only ever come from committed writes, so
/// a stale or empty cache costs extra writes and nothing else.
///
/// Unbounded by default: it holds one entry per (account, data source) pair
/// seen since the last merge flushed it. With [`InstanceCache::with_max_entries`]
/// the cache is cleared whenever a new key would exceed the limit.
#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: DashMap<(ObjectId, DataSourceId), OsAccountInstance>,
    max_entries: Option<usize>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: Some(max_entries.max(1)),
        }
    }

    pub fn best(
        &self,
        account_id: ObjectId,
        data_source_id: DataSourceId,
    ) -> Option<OsAccountInstance> {
        self.entries
            .get(&(account_id, data_source_id))
            .map(|entry| *entry.value())
    }

    /// Stores `instance` unless an equal or more significant one is cached.
    pub fn offer(&self, instance: OsAccountInstance) -> bool {
        let key = (instance.account_id, instance.data_source_id);
        if let Some(max_entries) = self.max_entries {
            // No shard guard may be held across clear().
            if self.entries.len() >= max_entries && !self.entries.contains_key(&key) {
                debug!(event = "instance_cache_reset", entries = self.entries.len());
                self.entries.clear();
            }
        }
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if instance
                    .instance_type
                    .is_more_significant_than(occupied.get().instance_type)
                {
                    occupied.insert(instance);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(instance);
                true
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct InstanceRegistrar {
    cache: Arc<InstanceCache>,
}

impl InstanceRegistrar {
    pub fn new(cache: Arc<InstanceCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    /// Records that `account` was seen on a data source.
    ///
    /// Returns the cached instance without writing when it is at least as
    /// significant as the request.
    pub fn record_instance(
        &self,
        tx: &CaseTransaction<'_>,
        account: &OsAccount,
        data_source_id: DataSourceId,
        instance_type: InstanceType,
    ) -> Result<OsAccountInstance, ResolverError> {
        if let Some(cached) = self.cache.best(account.id, data_source_id) {
            if !instance_type.is_more_significant_than(cached.instance_type) {
                debug!(
                    event = "instance_cache_hit",
                    account_id = account.id,
                    data_source_id = data_source_id,
                );
                return Ok(cached);
            }
        }

        let (instance, created) =
            instances::insert_instance_if_absent(tx, account.id, data_source_id, instance_type)?;

        let cache = Arc::clone(&self.cache);
        tx.on_commit(move || {
            cache.offer(instance);
        });
        if created {
            debug!(
                event = "instance_recorded",
                account_id = account.id,
                data_source_id = data_source_id,
                instance_type = ?instance_type,
            );
            tx.publish(AccountEvent::InstancesAdded {
                instances: vec![instance],
            });
        }
        Ok(instance)
    }

    pub fn most_significant_instance(
        &self,
        conn: &Connection,
        account_id: ObjectId,
        data_source_id: DataSourceId,
    ) -> Result<Option<OsAccountInstance>, ResolverError> {
        Ok(instances::most_significant_instance(
            conn,
            account_id,
            data_source_id,
        )?)
    }

    pub fn instances_for_account(
        &self,
        conn: &Connection,
        account_id: ObjectId,
    ) -> Result<Vec<OsAccountInstance>, ResolverError> {
        Ok(instances::instances_for_account(conn, account_id)?)
    }
}
