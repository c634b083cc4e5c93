//! # ID Resolver
//!
//! Bridges local record ids and remote-assigned ids.
//!
//! After a successful create the assigned id is written to the record link
//! table before the queue item is marked completed. Links are write-once: a
//! later create for the same record reads the stored id instead of creating a
//! second remote record.
//!
//! Before dispatch the resolver answers two questions for the dispatcher:
//!
//! 1. Which external id does this item's declared dependency resolve to?
//! 2. Which remote record does an update or delete target?

use crate::error::Result;
use crate::mapping::{MappingRegistry, ResolvedDependency};
use crate::models::{NewRecordLink, QueueItem, RecordLink};
use crate::remote::CreatedRecord;
use crate::store::QueueStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of looking up an item's declared dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyResolution {
    /// The item declares no dependency
    NotRequired,
    Resolved(ResolvedDependency),
    /// No external id is known yet for the referenced record
    Unresolved { record_id: String },
}

#[derive(Clone)]
pub struct IdResolver {
    store: Arc<dyn QueueStore>,
    mappings: Arc<MappingRegistry>,
}

impl IdResolver {
    pub fn new(store: Arc<dyn QueueStore>, mappings: Arc<MappingRegistry>) -> Self {
        Self { store, mappings }
    }

    /// Resolve `depends_on_external_id_of` against earlier items of the same
    /// correlation, falling back to the record link table.
    pub async fn resolve_dependency(&self, item: &QueueItem) -> Result<DependencyResolution> {
        let Some(record_id) = item.depends_on_external_id_of.as_deref() else {
            return Ok(DependencyResolution::NotRequired);
        };

        let earlier: Vec<QueueItem> = self
            .store
            .list_correlation(&item.correlation_id)
            .await?
            .into_iter()
            .filter(|other| other.sequence < item.sequence && other.record_id == record_id)
            .collect();

        // Latest earlier item that carries an id wins
        if let Some(external_id) = earlier
            .iter()
            .rev()
            .find_map(|other| other.external_id.clone())
        {
            return Ok(DependencyResolution::Resolved(ResolvedDependency {
                record_id: record_id.to_string(),
                external_id,
            }));
        }

        for other in earlier.iter().rev() {
            if let Some(link) = self.store.find_link(&other.table_name, record_id).await? {
                return Ok(DependencyResolution::Resolved(ResolvedDependency {
                    record_id: record_id.to_string(),
                    external_id: link.external_id,
                }));
            }
        }

        debug!(
            correlation_id = %item.correlation_id,
            sequence = item.sequence,
            dependency = %record_id,
            "Dependency has no external id yet"
        );
        Ok(DependencyResolution::Unresolved {
            record_id: record_id.to_string(),
        })
    }

    /// Remote id an update or delete should address
    pub async fn resolve_target(&self, item: &QueueItem) -> Result<Option<String>> {
        if let Some(link) = self.store.find_link(&item.table_name, &item.record_id).await? {
            return Ok(Some(link.external_id));
        }
        Ok(self
            .mappings
            .external_id_from_payload(&item.table_name, &item.payload))
    }

    /// Link left by an earlier successful create of the same record
    pub async fn existing_link(&self, item: &QueueItem) -> Result<Option<RecordLink>> {
        self.store.find_link(&item.table_name, &item.record_id).await
    }

    /// Persist the id assigned by a successful create.
    ///
    /// Returns the stored link. When a link already existed its id is kept and
    /// returned, so callers must use the returned id rather than `created`'s.
    pub async fn record_created(
        &self,
        item: &QueueItem,
        created: &CreatedRecord,
    ) -> Result<RecordLink> {
        let local_patch = match self
            .mappings
            .from_remote_shape(&item.table_name, &created.response)
        {
            Ok(patch) => Some(patch),
            Err(e) => {
                warn!(
                    table = %item.table_name,
                    record_id = %item.record_id,
                    "Create response could not be mapped back: {}",
                    e
                );
                None
            }
        };

        self.store
            .record_link(
                NewRecordLink {
                    table_name: item.table_name.clone(),
                    record_id: item.record_id.clone(),
                    external_id: created.external_id.clone(),
                    local_patch,
                    source_item_id: Some(item.id),
                },
                Utc::now(),
            )
            .await
    }
}
