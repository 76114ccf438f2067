//! Route table update strategies.
//!
//! Classical fabrics only accept the whole table, so every change is a
//! read-modify-write that must be serialized within the process. Fabrics
//! with the atomic capability accept single-entry adds and removes and need
//! no local lock. Both strategies read the table first, so a call that
//! finds the entry already in place records nothing to undo. The strategy
//! is chosen once, from the fabric's reported capabilities, when the
//! reconciler is built.

use async_trait::async_trait;
use fabric_api::{FabricResult, RouteTableEntry, RouterApi, RouterId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::guarded;
use crate::rollback::UndoAction;

/// How route table changes reach the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableUpdateMode {
    /// Whole-table replace under a process-local lock.
    Classical,
    /// Incremental add/remove of single entries.
    Atomic,
}

impl fmt::Display for TableUpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableUpdateMode::Classical => write!(f, "classical"),
            TableUpdateMode::Atomic => write!(f, "atomic"),
        }
    }
}

/// Adds and removes single entries of one router's table.
///
/// Each call returns the inverse action when it changed the table, and
/// `None` when the table was already in the requested state.
#[async_trait]
pub trait RouteTableUpdater: Send + Sync {
    /// The strategy in use.
    fn mode(&self) -> TableUpdateMode;

    /// Ensures `entry` is in the table.
    async fn add_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>>;

    /// Ensures `entry` is not in the table.
    async fn remove_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>>;
}

/// Whole-table read-modify-write, serialized by a process-local mutex.
///
/// Another process writing the same router can still lose updates; the
/// lock only protects writers sharing this instance.
pub struct ClassicalTable {
    routers: Arc<dyn RouterApi>,
    router_id: RouterId,
    lock: Mutex<()>,
}

impl ClassicalTable {
    pub fn new(routers: Arc<dyn RouterApi>, router_id: RouterId) -> Self {
        Self {
            routers,
            router_id,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RouteTableUpdater for ClassicalTable {
    fn mode(&self) -> TableUpdateMode {
        TableUpdateMode::Classical
    }

    async fn add_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>> {
        let _guard = guarded(cancel, async { Ok(self.lock.lock().await) }).await?;

        let router = guarded(cancel, self.routers.get_router(&self.router_id)).await?;
        if router.has_route(&entry) {
            debug!(entry = %entry, "Route already in table");
            return Ok(None);
        }

        let mut routes = router.routes;
        routes.push(entry);
        guarded(cancel, self.routers.update_routes(&self.router_id, routes)).await?;

        info!(router = %self.router_id, entry = %entry, "Added route table entry");
        Ok(Some(UndoAction::RemoveRouteEntry(entry)))
    }

    async fn remove_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>> {
        let _guard = guarded(cancel, async { Ok(self.lock.lock().await) }).await?;

        let router = guarded(cancel, self.routers.get_router(&self.router_id)).await?;
        if !router.has_route(&entry) {
            debug!(entry = %entry, "Route already absent from table");
            return Ok(None);
        }

        let routes: Vec<_> = router.routes.into_iter().filter(|r| r != &entry).collect();
        guarded(cancel, self.routers.update_routes(&self.router_id, routes)).await?;

        info!(router = %self.router_id, entry = %entry, "Removed route table entry");
        Ok(Some(UndoAction::AddRouteEntry(entry)))
    }
}

/// Incremental single-entry updates; the fabric serializes them.
///
/// Two callers racing on the same entry can both see it absent and both
/// record an undo for it.
pub struct AtomicTable {
    routers: Arc<dyn RouterApi>,
    router_id: RouterId,
}

impl AtomicTable {
    pub fn new(routers: Arc<dyn RouterApi>, router_id: RouterId) -> Self {
        Self { routers, router_id }
    }
}

#[async_trait]
impl RouteTableUpdater for AtomicTable {
    fn mode(&self) -> TableUpdateMode {
        TableUpdateMode::Atomic
    }

    async fn add_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>> {
        let router = guarded(cancel, self.routers.get_router(&self.router_id)).await?;
        if router.has_route(&entry) {
            debug!(entry = %entry, "Route already in table");
            return Ok(None);
        }

        guarded(cancel, self.routers.add_routes(&self.router_id, &[entry])).await?;
        info!(router = %self.router_id, entry = %entry, "Added route table entry");
        Ok(Some(UndoAction::RemoveRouteEntry(entry)))
    }

    async fn remove_entry(
        &self,
        entry: RouteTableEntry,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<UndoAction>> {
        let router = guarded(cancel, self.routers.get_router(&self.router_id)).await?;
        if !router.has_route(&entry) {
            debug!(entry = %entry, "Route already absent from table");
            return Ok(None);
        }

        guarded(cancel, self.routers.remove_routes(&self.router_id, &[entry])).await?;
        info!(router = %self.router_id, entry = %entry, "Removed route table entry");
        Ok(Some(UndoAction::AddRouteEntry(entry)))
    }
}

/// Builds the updater for `mode`.
pub fn table_for(
    mode: TableUpdateMode,
    routers: Arc<dyn RouterApi>,
    router_id: RouterId,
) -> Arc<dyn RouteTableUpdater> {
    match mode {
        TableUpdateMode::Classical => Arc::new(ClassicalTable::new(routers, router_id)),
        TableUpdateMode::Atomic => Arc::new(AtomicTable::new(routers, router_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_api::{FabricError, NetworkId, Router};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    /// Router that records table writes. Incremental updates are only
    /// accepted when `atomic` is set.
    struct TableOnly {
        routes: StdMutex<Vec<RouteTableEntry>>,
        writes: StdMutex<usize>,
        atomic: bool,
    }

    impl TableOnly {
        fn with(routes: Vec<RouteTableEntry>) -> Arc<Self> {
            Arc::new(Self {
                routes: StdMutex::new(routes),
                writes: StdMutex::new(0),
                atomic: false,
            })
        }

        fn atomic(routes: Vec<RouteTableEntry>) -> Arc<Self> {
            Arc::new(Self {
                routes: StdMutex::new(routes),
                writes: StdMutex::new(0),
                atomic: true,
            })
        }
    }

    #[async_trait]
    impl RouterApi for TableOnly {
        async fn get_router(&self, id: &RouterId) -> FabricResult<Router> {
            Ok(Router {
                id: id.clone(),
                name: String::new(),
                routes: self.routes.lock().unwrap().clone(),
            })
        }

        async fn update_routes(
            &self,
            id: &RouterId,
            routes: Vec<RouteTableEntry>,
        ) -> FabricResult<Router> {
            *self.writes.lock().unwrap() += 1;
            *self.routes.lock().unwrap() = routes;
            self.get_router(id).await
        }

        async fn list_attached_networks(&self, _id: &RouterId) -> FabricResult<Vec<NetworkId>> {
            Ok(vec![])
        }

        async fn add_routes(
            &self,
            id: &RouterId,
            routes: &[RouteTableEntry],
        ) -> FabricResult<Router> {
            if !self.atomic {
                return Err(FabricError::not_supported("atomic route update"));
            }
            *self.writes.lock().unwrap() += 1;
            {
                let mut table = self.routes.lock().unwrap();
                for route in routes {
                    if !table.contains(route) {
                        table.push(*route);
                    }
                }
            }
            self.get_router(id).await
        }

        async fn remove_routes(
            &self,
            id: &RouterId,
            routes: &[RouteTableEntry],
        ) -> FabricResult<Router> {
            if !self.atomic {
                return Err(FabricError::not_supported("atomic route update"));
            }
            *self.writes.lock().unwrap() += 1;
            self.routes.lock().unwrap().retain(|r| !routes.contains(r));
            self.get_router(id).await
        }
    }

    fn entry(dest: &str, nh: &str) -> RouteTableEntry {
        RouteTableEntry::new(dest.parse().unwrap(), nh.parse().unwrap())
    }

    #[tokio::test]
    async fn test_classical_add_preserves_other_entries() {
        let existing = entry("10.244.0.0/24", "192.168.1.4");
        let router = TableOnly::with(vec![existing]);
        let table = ClassicalTable::new(router.clone(), RouterId::new("r1"));
        let cancel = CancellationToken::new();

        let new = entry("10.244.1.0/24", "192.168.1.5");
        let undo = table.add_entry(new, &cancel).await.unwrap();

        assert_eq!(undo, Some(UndoAction::RemoveRouteEntry(new)));
        assert_eq!(*router.routes.lock().unwrap(), vec![existing, new]);
    }

    #[tokio::test]
    async fn test_classical_noop_does_not_write() {
        let present = entry("10.244.1.0/24", "192.168.1.5");
        let router = TableOnly::with(vec![present]);
        let table = ClassicalTable::new(router.clone(), RouterId::new("r1"));
        let cancel = CancellationToken::new();

        assert_eq!(table.add_entry(present, &cancel).await.unwrap(), None);
        assert_eq!(
            table
                .remove_entry(entry("10.244.9.0/24", "192.168.1.5"), &cancel)
                .await
                .unwrap(),
            None
        );
        assert_eq!(*router.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_classical_remove() {
        let keep = entry("10.244.0.0/24", "192.168.1.4");
        let gone = entry("10.244.1.0/24", "192.168.1.5");
        let router = TableOnly::with(vec![keep, gone]);
        let table = ClassicalTable::new(router.clone(), RouterId::new("r1"));

        let undo = table
            .remove_entry(gone, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(undo, Some(UndoAction::AddRouteEntry(gone)));
        assert_eq!(*router.routes.lock().unwrap(), vec![keep]);
    }

    #[tokio::test]
    async fn test_classical_concurrent_adds_keep_every_entry() {
        let router = TableOnly::with(vec![]);
        let table = Arc::new(ClassicalTable::new(router.clone(), RouterId::new("r1")));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let e = entry(&format!("10.244.{}.0/24", i), "192.168.1.5");
                table.add_entry(e, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(router.routes.lock().unwrap().len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classical_cancel_while_waiting_for_lock() {
        let router = TableOnly::with(vec![]);
        let table = ClassicalTable::new(router.clone(), RouterId::new("r1"));
        let held = table.lock.lock().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = table
            .add_entry(entry("10.244.1.0/24", "192.168.1.5"), &cancel)
            .await
            .unwrap_err();
        drop(held);

        assert_eq!(err, FabricError::Cancelled);
        assert_eq!(*router.writes.lock().unwrap(), 0);
        assert!(router.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_atomic_add_and_remove() {
        let keep = entry("10.244.0.0/24", "192.168.1.4");
        let router = TableOnly::atomic(vec![keep]);
        let table = AtomicTable::new(router.clone(), RouterId::new("r1"));
        let cancel = CancellationToken::new();

        let new = entry("10.244.1.0/24", "192.168.1.5");
        assert_eq!(
            table.add_entry(new, &cancel).await.unwrap(),
            Some(UndoAction::RemoveRouteEntry(new))
        );
        assert_eq!(*router.routes.lock().unwrap(), vec![keep, new]);

        assert_eq!(
            table.remove_entry(new, &cancel).await.unwrap(),
            Some(UndoAction::AddRouteEntry(new))
        );
        assert_eq!(*router.routes.lock().unwrap(), vec![keep]);
        assert_eq!(*router.writes.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_atomic_noop_does_not_write() {
        let present = entry("10.244.7.0/24", "192.168.1.5");
        let router = TableOnly::atomic(vec![present]);
        let table = AtomicTable::new(router.clone(), RouterId::new("r1"));
        let cancel = CancellationToken::new();

        assert_eq!(table.add_entry(present, &cancel).await.unwrap(), None);
        assert_eq!(
            table
                .remove_entry(entry("10.244.9.0/24", "192.168.1.5"), &cancel)
                .await
                .unwrap(),
            None
        );
        assert_eq!(*router.writes.lock().unwrap(), 0);
        assert_eq!(*router.routes.lock().unwrap(), vec![present]);
    }

    #[tokio::test]
    async fn test_atomic_requires_capability() {
        let router = TableOnly::with(vec![]);
        let table = AtomicTable::new(router, RouterId::new("r1"));

        let err = table
            .add_entry(entry("10.244.1.0/24", "192.168.1.5"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NotSupported { .. }));
    }

    #[test]
    fn test_table_for_mode() {
        let router = TableOnly::with(vec![]);
        assert_eq!(
            table_for(TableUpdateMode::Atomic, router.clone(), RouterId::new("r1")).mode(),
            TableUpdateMode::Atomic
        );
        assert_eq!(
            table_for(TableUpdateMode::Classical, router, RouterId::new("r1")).mode(),
            TableUpdateMode::Classical
        );
    }
}
