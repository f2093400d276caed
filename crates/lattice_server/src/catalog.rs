//! Catalog access capability.
//!
//! Splits record their outcome in the catalog tables: the root table for
//! meta-region parents, the meta table otherwise. The compactor only needs
//! one operation — an atomic multi-cell update of a single catalog row —
//! so that is the whole trait. The loopback implementation resolves the
//! catalog region through the local registry, which covers deployments
//! (and tests) where this server hosts the catalog tier itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::region::{
    BatchOp, BatchUpdate, RegionDescriptor, META_TABLE, ROOT_TABLE,
};
use crate::registry::RegionRegistry;

/// Which catalog table a row update targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogTier {
    Root,
    Meta,
}

impl CatalogTier {
    pub fn table_name(self) -> &'static str {
        match self {
            CatalogTier::Root => ROOT_TABLE,
            CatalogTier::Meta => META_TABLE,
        }
    }
}

/// Atomic per-row catalog updates.
#[async_trait]
pub trait CatalogAccess: Send + Sync + 'static {
    /// Apply every `(column, value)` cell to `row` in one atomic update.
    async fn apply_row(
        &self,
        tier: CatalogTier,
        row: Vec<u8>,
        cells: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> anyhow::Result<()>;
}

/// Serialized descriptor cell value.
pub fn encode_descriptor(desc: &RegionDescriptor) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(desc)?)
}

pub fn decode_descriptor(raw: &[u8]) -> anyhow::Result<RegionDescriptor> {
    Ok(serde_json::from_slice(raw)?)
}

/// Catalog writer that routes to catalog regions hosted by this server.
pub struct LoopbackCatalog {
    registry: Arc<RegionRegistry>,
}

impl LoopbackCatalog {
    pub fn new(registry: Arc<RegionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CatalogAccess for LoopbackCatalog {
    async fn apply_row(
        &self,
        tier: CatalogTier,
        row: Vec<u8>,
        cells: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> anyhow::Result<()> {
        let table = tier.table_name();
        let target = self
            .registry
            .regions_to_check()
            .into_iter()
            .find(|r| r.descriptor().table.name == table && r.descriptor().contains_row(&row));
        let Some(region) = target else {
            anyhow::bail!("no local {table} region covers catalog row");
        };
        let ops = cells
            .into_iter()
            .map(|(column, value)| BatchOp::Put { column, value })
            .collect();
        region.batch_update(0, BatchUpdate { row, ops })
    }
}
