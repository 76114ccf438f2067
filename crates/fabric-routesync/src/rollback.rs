//! Compensating actions for partially applied route operations.
//!
//! Every mutating step of CreateRoute / DeleteRoute that actually changed
//! fabric state pushes the action that reverses it. On failure the stack is
//! unwound in reverse order; on success it is discarded. Undo failures are
//! logged and counted but never replace the error that triggered the unwind.

use async_trait::async_trait;
use fabric_api::{
    AllowedAddressPair, FabricResult, PortApi, PortId, PortUpdate, RouteTableEntry, RuleId,
    RuleSpec, SecurityGroupApi, SecurityGroupId,
};
use std::collections::BTreeSet;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::table::RouteTableUpdater;

/// One compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Remove a route table entry that was added.
    RemoveRouteEntry(RouteTableEntry),
    /// Re-add a route table entry that was removed.
    AddRouteEntry(RouteTableEntry),
    /// Delete a rule that was created.
    DeleteRule(RuleId),
    /// Re-create a rule that was deleted.
    CreateRule(RuleSpec),
    /// Put back a port's allowed-address-pairs as they were.
    RestoreAllowedAddressPairs {
        port: PortId,
        pairs: Vec<AllowedAddressPair>,
    },
    /// Put back a port's security groups as they were.
    RestoreSecurityGroups {
        port: PortId,
        groups: BTreeSet<SecurityGroupId>,
    },
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoAction::RemoveRouteEntry(entry) => write!(f, "remove route {}", entry),
            UndoAction::AddRouteEntry(entry) => write!(f, "re-add route {}", entry),
            UndoAction::DeleteRule(id) => write!(f, "delete rule {}", id),
            UndoAction::CreateRule(spec) => {
                write!(f, "re-create rule {} on {}", spec, spec.security_group_id)
            }
            UndoAction::RestoreAllowedAddressPairs { port, pairs } => write!(
                f,
                "restore {} allowed-address-pairs on port {}",
                pairs.len(),
                port
            ),
            UndoAction::RestoreSecurityGroups { port, groups } => {
                write!(f, "restore {} security groups on port {}", groups.len(), port)
            }
        }
    }
}

/// Applies undo actions against the fabric.
#[async_trait]
pub trait UndoExecutor: Send + Sync {
    /// Applies one action.
    async fn undo(&self, action: &UndoAction) -> FabricResult<()>;
}

/// LIFO stack of undo actions for one operation.
#[derive(Debug)]
pub struct RollbackStack {
    operation: String,
    actions: Vec<UndoAction>,
}

impl RollbackStack {
    /// Creates an empty stack; `operation` labels log lines.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            actions: Vec::new(),
        }
    }

    /// Records the inverse of a step that just changed fabric state.
    pub fn push(&mut self, action: UndoAction) {
        debug!(operation = %self.operation, action = %action, "Recorded undo action");
        self.actions.push(action);
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Recorded actions, oldest first.
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Drops the stack without applying anything.
    pub fn discard(self) {
        debug!(
            operation = %self.operation,
            actions = self.actions.len(),
            "Discarding rollback stack"
        );
    }

    /// Applies every action newest-first and returns how many failed.
    pub async fn unwind(self, executor: &dyn UndoExecutor) -> usize {
        let mut failed = 0;
        for action in self.actions.iter().rev() {
            match executor.undo(action).await {
                Ok(()) => debug!(operation = %self.operation, action = %action, "Undo applied"),
                Err(e) => {
                    failed += 1;
                    warn!(
                        operation = %self.operation,
                        action = %action,
                        error = %e,
                        "Undo failed, fabric may hold a partial change"
                    );
                }
            }
        }
        failed
    }
}

/// Undo executor backed by the fabric clients of a reconciler.
///
/// Undo calls ignore the caller's cancellation token.
pub(crate) struct FabricUndo<'a> {
    pub(crate) table: &'a dyn RouteTableUpdater,
    pub(crate) ports: &'a dyn PortApi,
    pub(crate) security_groups: &'a dyn SecurityGroupApi,
}

#[async_trait]
impl UndoExecutor for FabricUndo<'_> {
    async fn undo(&self, action: &UndoAction) -> FabricResult<()> {
        let never = CancellationToken::new();
        match action {
            UndoAction::RemoveRouteEntry(entry) => {
                self.table.remove_entry(*entry, &never).await.map(|_| ())
            }
            UndoAction::AddRouteEntry(entry) => {
                self.table.add_entry(*entry, &never).await.map(|_| ())
            }
            UndoAction::DeleteRule(id) => match self.security_groups.delete_rule(id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
            UndoAction::CreateRule(spec) => match self.security_groups.create_rule(spec).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_conflict() => Ok(()),
                Err(e) => Err(e),
            },
            UndoAction::RestoreAllowedAddressPairs { port, pairs } => self
                .ports
                .update_port(port, &PortUpdate::allowed_address_pairs(pairs.clone()))
                .await
                .map(|_| ()),
            UndoAction::RestoreSecurityGroups { port, groups } => self
                .ports
                .update_port(port, &PortUpdate::security_groups(groups.clone()))
                .await
                .map(|_| ()),
        }
    }
}
