//! In-memory [`RemoteSession`] with scripted task snapshots, plus
//! builders for small inventory trees. Compiled for unit tests and, with
//! the `test-util` feature, for downstream integration tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::VmConfigSpec;
use crate::error::{VctError, VctResult};
use crate::remote::{InventoryBrowser, RemoteSession};
use crate::types::{
    ContainerView, DatastoreSummary, InventoryNode, LiveDevice, ManagedObjectRef, NodeDetail,
    ObjectKind, PowerAction, Question, QuestionChoice, TaskRef, TaskSnapshot,
};

// ─── Inventory builders ──────────────────────────────────────────────────────

pub fn folder(name: &str) -> InventoryNode {
    InventoryNode::new(ManagedObjectRef::new("Folder", format!("group-{name}")), name)
        .with_detail(NodeDetail::Folder {
            child_type: vec!["Folder".into(), "VirtualMachine".into()],
        })
}

pub fn vm(name: &str, id: &str) -> InventoryNode {
    InventoryNode::new(ManagedObjectRef::new("VirtualMachine", id), name)
}

pub fn network(name: &str, id: &str) -> InventoryNode {
    InventoryNode::new(ManagedObjectRef::new("Network", id), name)
}

pub fn datastore(name: &str, fs_type: &str, capacity: u64, free: u64, uncommitted: Option<u64>) -> InventoryNode {
    InventoryNode::new(ManagedObjectRef::new("Datastore", format!("datastore-{name}")), name)
        .with_detail(NodeDetail::Datastore(DatastoreSummary {
            name: name.to_string(),
            capacity,
            free_space: free,
            uncommitted,
            fs_type: fs_type.to_string(),
            accessible: true,
        }))
}

/// Datacenter whose VM root folder is `vm_root`.
pub fn datacenter(name: &str, vm_root: InventoryNode) -> InventoryNode {
    let mut dc = InventoryNode::new(ManagedObjectRef::new("Datacenter", format!("datacenter-{name}")), name);
    let mut root = vm_root;
    root.parent = Some(dc.link());
    dc.detail = NodeDetail::Datacenter { vm_folder: Some(Box::new(root)) };
    dc
}

pub fn cluster(name: &str, datastores: Vec<InventoryNode>, networks: Vec<InventoryNode>) -> InventoryNode {
    InventoryNode::new(ManagedObjectRef::new("ClusterComputeResource", format!("domain-{name}")), name)
        .with_detail(NodeDetail::ComputeResource {
            datastores,
            networks,
            resource_pool: Some(ManagedObjectRef::new("ResourcePool", format!("resgroup-{name}"))),
        })
}

/// Question with choices in the given order and no default.
pub fn question(id: &str, choices: &[(i32, &str)]) -> Question {
    Question {
        id: id.to_string(),
        text: format!("question {id}"),
        choices: choices
            .iter()
            .map(|(key, label)| QuestionChoice { key: *key, label: label.to_string() })
            .collect(),
        default_key: None,
    }
}

pub fn live_device(key: i32, type_name: &str, controller_key: Option<i32>, unit_number: Option<i32>) -> LiveDevice {
    LiveDevice { key, type_name: type_name.to_string(), controller_key, unit_number }
}

// ─── Fake session ────────────────────────────────────────────────────────────

/// A request the fake session received.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Create {
        folder: ManagedObjectRef,
        pool: ManagedObjectRef,
        spec: VmConfigSpec,
    },
    Reconfigure {
        vm: ManagedObjectRef,
        spec: VmConfigSpec,
    },
    Power {
        vm: ManagedObjectRef,
        action: PowerAction,
    },
}

struct FakeInventory {
    nodes: Vec<InventoryNode>,
}

#[async_trait::async_trait]
impl InventoryBrowser for FakeInventory {
    async fn container_view(
        &self,
        _root: &ManagedObjectRef,
        kinds: &[ObjectKind],
        _recursive: bool,
    ) -> VctResult<ContainerView> {
        Ok(ContainerView::new(
            self.nodes.iter().filter(|n| kinds.contains(&n.kind)).cloned().collect(),
        ))
    }
}

/// Scripted session. Task snapshots are handed out in order and the last
/// one repeats; with none scripted every task reports success.
pub struct FakeSession {
    root: ManagedObjectRef,
    inventory: Option<FakeInventory>,
    live: Vec<LiveDevice>,
    snapshots: Mutex<VecDeque<TaskSnapshot>>,
    snapshot_targets: Mutex<Vec<Option<ManagedObjectRef>>>,
    answers: Mutex<Vec<(ManagedObjectRef, String, i32)>>,
    submissions: Mutex<Vec<Submission>>,
    fail_submissions: Option<VctError>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            root: ManagedObjectRef::new("Folder", "group-d1"),
            inventory: Some(FakeInventory { nodes: Vec::new() }),
            live: Vec::new(),
            snapshots: Mutex::new(VecDeque::new()),
            snapshot_targets: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            fail_submissions: None,
        }
    }

    /// Session without a view manager.
    pub fn without_inventory(mut self) -> Self {
        self.inventory = None;
        self
    }

    pub fn with_inventory_nodes(mut self, nodes: Vec<InventoryNode>) -> Self {
        self.inventory = Some(FakeInventory { nodes });
        self
    }

    pub fn with_snapshots(self, snapshots: Vec<TaskSnapshot>) -> Self {
        *lock(&self.snapshots) = snapshots.into();
        self
    }

    pub fn with_live_devices(mut self, devices: Vec<LiveDevice>) -> Self {
        self.live = devices;
        self
    }

    /// Every submission fails with `err`.
    pub fn failing_submissions(mut self, err: VctError) -> Self {
        self.fail_submissions = Some(err);
        self
    }

    pub fn answers(&self) -> Vec<(ManagedObjectRef, String, i32)> {
        lock(&self.answers).clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    /// The `target` argument of every snapshot poll, in order.
    pub fn snapshot_targets(&self) -> Vec<Option<ManagedObjectRef>> {
        lock(&self.snapshot_targets).clone()
    }

    fn submit(&self, submission: Submission) -> VctResult<TaskRef> {
        if let Some(err) = &self.fail_submissions {
            return Err(err.clone());
        }
        let mut subs = lock(&self.submissions);
        subs.push(submission);
        Ok(ManagedObjectRef::new("Task", format!("task-{}", subs.len())))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl RemoteSession for FakeSession {
    fn root_folder(&self) -> VctResult<ManagedObjectRef> {
        Ok(self.root.clone())
    }

    fn inventory(&self) -> Option<&dyn InventoryBrowser> {
        self.inventory.as_ref().map(|i| i as &dyn InventoryBrowser)
    }

    async fn create_vm(
        &self,
        folder: &ManagedObjectRef,
        pool: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> VctResult<TaskRef> {
        self.submit(Submission::Create {
            folder: folder.clone(),
            pool: pool.clone(),
            spec: spec.clone(),
        })
    }

    async fn reconfigure_vm(&self, vm: &ManagedObjectRef, spec: &VmConfigSpec) -> VctResult<TaskRef> {
        self.submit(Submission::Reconfigure { vm: vm.clone(), spec: spec.clone() })
    }

    async fn power(&self, vm: &ManagedObjectRef, action: PowerAction) -> VctResult<Option<TaskRef>> {
        let task = self.submit(Submission::Power { vm: vm.clone(), action })?;
        Ok((!action.is_guest_operation()).then_some(task))
    }

    async fn task_snapshot(
        &self,
        _task: &TaskRef,
        target: Option<&ManagedObjectRef>,
    ) -> VctResult<TaskSnapshot> {
        lock(&self.snapshot_targets).push(target.cloned());
        let mut queue = lock(&self.snapshots);
        let snap = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(snap.unwrap_or_else(TaskSnapshot::success))
    }

    async fn answer_question(
        &self,
        vm: &ManagedObjectRef,
        question_id: &str,
        choice_key: i32,
    ) -> VctResult<()> {
        lock(&self.answers).push((vm.clone(), question_id.to_string(), choice_key));
        Ok(())
    }

    async fn live_devices(&self, _vm: &ManagedObjectRef) -> VctResult<Vec<LiveDevice>> {
        Ok(self.live.clone())
    }
}
