//! The per-cluster node security group.
//!
//! The group is found by name, created on first need, and remembered for
//! the life of the reconciler. Only the create path may create it.

use fabric_api::{SecurityGroupApi, SecurityGroupId};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::guarded;
use crate::error::{Result, RouteSyncError};

const GROUP_DESCRIPTION: &str = "Pod network ingress for cluster nodes";

#[derive(Debug, Clone)]
struct CachedGroup {
    name: String,
    id: SecurityGroupId,
}

/// Lazily resolved node security group.
#[derive(Debug)]
pub struct NodeSecurityGroup {
    prefix: String,
    cached: OnceCell<CachedGroup>,
}

impl NodeSecurityGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cached: OnceCell::new(),
        }
    }

    /// Name of the group for `cluster_name`.
    pub fn group_name(&self, cluster_name: &str) -> String {
        format!("{}-{}-nodes", self.prefix, cluster_name)
    }

    /// Returns the group, looking it up by name and creating it if absent.
    pub async fn ensure(
        &self,
        api: &dyn SecurityGroupApi,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<SecurityGroupId> {
        let name = self.group_name(cluster_name);
        if let Some(id) = self.cached_for(&name) {
            return Ok(id);
        }

        let group = self
            .cached
            .get_or_try_init(|| async {
                let id = lookup_or_create(api, &name, cancel).await?;
                Ok::<_, RouteSyncError>(CachedGroup {
                    name: name.clone(),
                    id,
                })
            })
            .await?;
        if group.name == name {
            return Ok(group.id.clone());
        }

        warn!(name = %name, cached = %group.name, "Node security group requested for a second cluster, not caching");
        lookup_or_create(api, &name, cancel).await
    }

    /// Returns the group if it already exists. Never creates it.
    pub async fn find(
        &self,
        api: &dyn SecurityGroupApi,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SecurityGroupId>> {
        let name = self.group_name(cluster_name);
        if let Some(id) = self.cached_for(&name) {
            return Ok(Some(id));
        }

        let found = guarded(cancel, api.lookup_group_by_name(&name)).await?;
        Ok(found.map(|group| {
            // Loses to any value already set, including another cluster's.
            let _ = self.cached.set(CachedGroup {
                name,
                id: group.id.clone(),
            });
            group.id
        }))
    }

    fn cached_for(&self, name: &str) -> Option<SecurityGroupId> {
        self.cached
            .get()
            .filter(|group| group.name == name)
            .map(|group| group.id.clone())
    }
}

async fn lookup_or_create(
    api: &dyn SecurityGroupApi,
    name: &str,
    cancel: &CancellationToken,
) -> Result<SecurityGroupId> {
    if let Some(group) = guarded(cancel, api.lookup_group_by_name(name)).await? {
        return Ok(group.id);
    }
    let group = guarded(cancel, api.create_group(name, GROUP_DESCRIPTION)).await?;
    info!(group = %group.id, name = %name, "Created node security group");
    Ok(group.id)
}
