//! Shared types for the vSphere lifecycle crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VctError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for connecting to a vCenter / ESXi host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VimConfig {
    /// vCenter or ESXi hostname / IP (e.g. "vcenter.lab.local")
    pub host: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// VI/JSON API release segment, e.g. "8.0.1.0"
    #[serde(default = "default_api_release")]
    pub api_release: String,
    /// Delay between task polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Give up watching a task after this many seconds (None = wait forever)
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }
fn default_api_release() -> String { "8.0.1.0".into() }
fn default_poll_interval() -> u64 { 1000 }

impl Default for VimConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: default_port(),
            insecure: false,
            timeout_secs: default_timeout(),
            api_release: default_api_release(),
            poll_interval_ms: default_poll_interval(),
            task_timeout_secs: None,
        }
    }
}

/// Config view that is safe to hand out (no password).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VimConfigSafe {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub insecure: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Managed objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference to a remote managed object (e.g. `Folder:group-v3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "_typeName", rename = "ManagedObjectReference")]
pub struct ManagedObjectRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    pub fn object_kind(&self) -> ObjectKind {
        ObjectKind::from_type_name(&self.kind)
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Remote tasks are addressed like any other managed object.
pub type TaskRef = ManagedObjectRef;

/// Inventory object categories the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Datacenter,
    Folder,
    /// Standalone hosts and clusters alike
    ComputeResource,
    Datastore,
    Network,
    VirtualMachine,
    ResourcePool,
    Other,
}

impl ObjectKind {
    /// Map a managed-object type name to its category.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "Datacenter" => Self::Datacenter,
            "Folder" => Self::Folder,
            "ComputeResource" | "ClusterComputeResource" => Self::ComputeResource,
            "Datastore" => Self::Datastore,
            "Network" | "DistributedVirtualPortgroup" | "OpaqueNetwork" => Self::Network,
            "VirtualMachine" => Self::VirtualMachine,
            "ResourcePool" | "VirtualApp" => Self::ResourcePool,
            _ => Self::Other,
        }
    }

    /// Type name used when asking for a container view of this kind.
    pub fn view_type(&self) -> &'static str {
        match self {
            Self::Datacenter => "Datacenter",
            Self::Folder => "Folder",
            Self::ComputeResource => "ComputeResource",
            Self::Datastore => "Datastore",
            Self::Network => "Network",
            Self::VirtualMachine => "VirtualMachine",
            Self::ResourcePool => "ResourcePool",
            Self::Other => "ManagedEntity",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.view_type())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Non-owning link from a node to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub moref: ManagedObjectRef,
    pub name: String,
}

/// `Datastore.summary` as reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreSummary {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capacity: u64,
    #[serde(default)]
    pub free_space: u64,
    #[serde(default)]
    pub uncommitted: Option<u64>,
    /// Filesystem type, e.g. "VMFS", "NFS", "vsan"
    #[serde(default, rename = "type")]
    pub fs_type: String,
    #[serde(default = "default_true")]
    pub accessible: bool,
}

fn default_true() -> bool { true }

/// Kind-specific payload of an inventory node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum NodeDetail {
    #[default]
    None,
    Datacenter {
        vm_folder: Option<Box<InventoryNode>>,
    },
    Folder {
        child_type: Vec<String>,
    },
    ComputeResource {
        datastores: Vec<InventoryNode>,
        networks: Vec<InventoryNode>,
        resource_pool: Option<ManagedObjectRef>,
    },
    Datastore(DatastoreSummary),
}

/// Snapshot of one object in the remote inventory tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryNode {
    pub moref: ManagedObjectRef,
    pub name: String,
    pub kind: ObjectKind,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    #[serde(default)]
    pub children: Vec<InventoryNode>,
    #[serde(default)]
    pub detail: NodeDetail,
}

impl InventoryNode {
    pub fn new(moref: ManagedObjectRef, name: impl Into<String>) -> Self {
        let kind = moref.object_kind();
        Self {
            moref,
            name: name.into(),
            kind,
            parent: None,
            children: Vec::new(),
            detail: NodeDetail::None,
        }
    }

    pub fn with_detail(mut self, detail: NodeDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Append a child, pointing its parent link back at `self`.
    pub fn with_child(mut self, mut child: InventoryNode) -> Self {
        child.parent = Some(self.link());
        self.children.push(child);
        self
    }

    pub fn link(&self) -> ParentLink {
        ParentLink { moref: self.moref.clone(), name: self.name.clone() }
    }

    /// Folders are the only nodes that carry a `childType` list.
    pub fn is_folder(&self) -> bool {
        matches!(self.detail, NodeDetail::Folder { .. })
    }

    pub fn vm_folder(&self) -> Option<&InventoryNode> {
        match &self.detail {
            NodeDetail::Datacenter { vm_folder } => vm_folder.as_deref(),
            _ => None,
        }
    }

    pub fn datastores(&self) -> &[InventoryNode] {
        match &self.detail {
            NodeDetail::ComputeResource { datastores, .. } => datastores,
            _ => &[],
        }
    }

    pub fn networks(&self) -> &[InventoryNode] {
        match &self.detail {
            NodeDetail::ComputeResource { networks, .. } => networks,
            _ => &[],
        }
    }

    pub fn resource_pool(&self) -> Option<&ManagedObjectRef> {
        match &self.detail {
            NodeDetail::ComputeResource { resource_pool, .. } => resource_pool.as_ref(),
            _ => None,
        }
    }

    pub fn datastore_summary(&self) -> Option<&DatastoreSummary> {
        match &self.detail {
            NodeDetail::Datastore(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Ordered snapshot of the members of a container view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerView {
    members: Vec<InventoryNode>,
}

impl ContainerView {
    pub fn new(members: Vec<InventoryNode>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[InventoryNode] {
        &self.members
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InventoryNode> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<'a> IntoIterator for &'a ContainerView {
    type Item = &'a InventoryNode;
    type IntoIter = std::slice::Iter<'a, InventoryNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tasks / Questions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[serde(alias = "queued")]
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One choice of a pending question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionChoice {
    pub key: i32,
    pub label: String,
}

/// A blocking question raised by a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    /// Display order
    pub choices: Vec<QuestionChoice>,
    #[serde(default)]
    pub default_key: Option<i32>,
}

impl Question {
    pub fn has_choice(&self, key: i32) -> bool {
        self.choices.iter().any(|c| c.key == key)
    }

    pub fn label_of(&self, key: i32) -> Option<&str> {
        self.choices
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.label.as_str())
    }
}

/// Point-in-time view of a remote task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub state: TaskState,
    /// Raw progress value; may be absent or not a number at all
    #[serde(default)]
    pub progress: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub pending_question: Option<Question>,
}

impl TaskSnapshot {
    pub fn running(progress: Option<i64>) -> Self {
        Self {
            state: TaskState::Running,
            progress: progress.map(serde_json::Value::from),
            error_message: None,
            pending_question: None,
        }
    }

    pub fn success() -> Self {
        Self {
            state: TaskState::Success,
            progress: Some(100.into()),
            error_message: None,
            pending_question: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            state: TaskState::Error,
            progress: None,
            error_message: Some(msg.into()),
            pending_question: None,
        }
    }

    pub fn with_question(mut self, question: Question) -> Self {
        self.pending_question = Some(question);
        self
    }

    /// Progress as a percentage, only when the remote sent an integer in 0..=100.
    pub fn progress_pct(&self) -> Option<u8> {
        self.progress
            .as_ref()
            .and_then(|v| v.as_i64())
            .filter(|p| (0..=100).contains(p))
            .map(|p| p as u8)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Power / live devices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Reset,
    Reboot,
    Shutdown,
}

impl PowerAction {
    /// Remote method name on `VirtualMachine`.
    pub fn method(&self) -> &'static str {
        match self {
            Self::On => "PowerOnVM_Task",
            Self::Off => "PowerOffVM_Task",
            Self::Reset => "ResetVM_Task",
            Self::Reboot => "RebootGuest",
            Self::Shutdown => "ShutdownGuest",
        }
    }

    /// Guest operations go through VMware Tools and return no task.
    pub fn is_guest_operation(&self) -> bool {
        matches!(self, Self::Reboot | Self::Shutdown)
    }
}

impl FromStr for PowerAction {
    type Err = VctError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "reset" => Ok(Self::Reset),
            "reboot" => Ok(Self::Reboot),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(VctError::new(
                crate::error::VctErrorKind::Other,
                format!("Unknown power action '{other}' (expected on, off, reset, reboot, shutdown)"),
            )),
        }
    }
}

/// A device already present on a VM, as reported by `config.hardware.device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDevice {
    pub key: i32,
    pub type_name: String,
    #[serde(default)]
    pub controller_key: Option<i32>,
    #[serde(default)]
    pub unit_number: Option<i32>,
}

impl LiveDevice {
    pub fn is_optical(&self) -> bool {
        self.type_name == "VirtualCdrom"
    }
}
