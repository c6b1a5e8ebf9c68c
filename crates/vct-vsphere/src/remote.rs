//! The seam between lifecycle logic and the endpoint.
//!
//! [`crate::vim::VimClient`] implements these traits over HTTP; tests use
//! the scripted session in `testing`.

use crate::config::VmConfigSpec;
use crate::error::VctResult;
use crate::types::{
    ContainerView, LiveDevice, ManagedObjectRef, ObjectKind, PowerAction, TaskRef, TaskSnapshot,
};

// ─── Inventory browsing ──────────────────────────────────────────────────────

/// Container view support, only present when the endpoint has a view manager.
#[async_trait::async_trait]
pub trait InventoryBrowser: Send + Sync {
    /// Snapshot every object of `kinds` below `root`.
    async fn container_view(
        &self,
        root: &ManagedObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> VctResult<ContainerView>;
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// An authenticated connection to a vCenter or ESXi endpoint.
#[async_trait::async_trait]
pub trait RemoteSession: Send + Sync {
    /// Root folder of the inventory tree.
    fn root_folder(&self) -> VctResult<ManagedObjectRef>;

    /// `None` when the endpoint cannot create container views.
    fn inventory(&self) -> Option<&dyn InventoryBrowser>;

    /// Submit `CreateVM_Task` in `folder`, placing the VM in `pool`.
    async fn create_vm(
        &self,
        folder: &ManagedObjectRef,
        pool: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> VctResult<TaskRef>;

    /// Submit `ReconfigVM_Task`.
    async fn reconfigure_vm(&self, vm: &ManagedObjectRef, spec: &VmConfigSpec) -> VctResult<TaskRef>;

    /// Guest operations return `None`: they complete without a task.
    async fn power(&self, vm: &ManagedObjectRef, action: PowerAction) -> VctResult<Option<TaskRef>>;

    /// Current task state. When `target` is given, its pending question
    /// (if any) is attached to the snapshot.
    async fn task_snapshot(
        &self,
        task: &TaskRef,
        target: Option<&ManagedObjectRef>,
    ) -> VctResult<TaskSnapshot>;

    async fn answer_question(
        &self,
        vm: &ManagedObjectRef,
        question_id: &str,
        choice_key: i32,
    ) -> VctResult<()>;

    /// Devices currently attached to `vm`.
    async fn live_devices(&self, vm: &ManagedObjectRef) -> VctResult<Vec<LiveDevice>>;
}
