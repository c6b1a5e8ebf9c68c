//! Inventory lookups: container views, name resolution, VM folders and
//! datastore capacity.
//!
//! Views are owned snapshots, so everything past [`InventoryIndex::create_container`]
//! is a pure function over [`ContainerView`] and needs no session.
//! Folder traversal below a datacenter's VM root goes exactly one level
//! deep; deeper nesting is not searched.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{VctError, VctErrorKind, VctResult};
use crate::remote::RemoteSession;
use crate::types::{ContainerView, InventoryNode, ManagedObjectRef, ObjectKind};
use crate::units::{disk_size_format, percent_format};

/// Filesystem type whose datastores appear in capacity reports.
pub const CAPACITY_FS_TYPE: &str = "VMFS";

/// Column titles of the capacity header row.
pub const CAPACITY_HEADER: [&str; 6] =
    ["Datastore", "Capacity", "Provisioned", "Pct", "Free Space", "Pct"];

/// Opens container views on a connected session.
pub struct InventoryIndex<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> InventoryIndex<'a> {
    pub fn new(session: &'a dyn RemoteSession) -> Self {
        Self { session }
    }

    /// Snapshot the objects of `kinds` below `scope`.
    pub async fn create_container(
        &self,
        scope: &ManagedObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> VctResult<ContainerView> {
        let browser = self.session.inventory().ok_or_else(|| {
            VctError::inventory_unavailable("Session exposes no view manager; inventory cannot be browsed")
        })?;
        log::debug!("Creating container view over {scope} for {kinds:?} (recursive={recursive})");
        browser.container_view(scope, kinds, recursive).await
    }

    /// Recursive view of `kinds` from the root folder.
    pub async fn root_container(&self, kinds: &[ObjectKind]) -> VctResult<ContainerView> {
        let root = self.session.root_folder()?;
        self.create_container(&root, kinds, true).await
    }

    pub async fn datacenters(&self) -> VctResult<ContainerView> {
        self.root_container(&[ObjectKind::Datacenter]).await
    }

    /// Clusters and standalone hosts.
    pub async fn clusters(&self) -> VctResult<ContainerView> {
        self.root_container(&[ObjectKind::ComputeResource]).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Name resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// First node called `name`.
pub fn find_named<'n>(nodes: &'n [InventoryNode], name: &str) -> Option<&'n InventoryNode> {
    nodes.iter().find(|n| n.name == name)
}

/// First view member called `name`; `None` lets the caller re-prompt or abort.
pub fn resolve_by_name<'v>(view: &'v ContainerView, name: &str) -> Option<&'v InventoryNode> {
    find_named(view.members(), name)
}

/// Attribute that [`list_attribute`] can project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttr {
    Name,
    Moref,
    Kind,
    Parent,
}

impl FromStr for NodeAttr {
    type Err = VctError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "moref" | "_moId" | "moid" => Ok(Self::Moref),
            "kind" | "type" => Ok(Self::Kind),
            "parent" => Ok(Self::Parent),
            other => Err(VctError::new(
                VctErrorKind::Other,
                format!("Unknown inventory attribute '{other}'"),
            )),
        }
    }
}

/// Project one attribute across the view, in view order. A missing parent
/// projects as an empty string.
pub fn list_attribute(view: &ContainerView, attr: NodeAttr) -> Vec<String> {
    view.iter()
        .map(|node| match attr {
            NodeAttr::Name => node.name.clone(),
            NodeAttr::Moref => node.moref.value.clone(),
            NodeAttr::Kind => node.kind.to_string(),
            NodeAttr::Parent => node.parent.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
        })
        .collect()
}

/// Cluster or standalone host called `cluster`.
pub fn require_cluster<'v>(view: &'v ContainerView, cluster: &str) -> VctResult<&'v InventoryNode> {
    resolve_by_name(view, cluster)
        .filter(|n| n.kind == ObjectKind::ComputeResource)
        .ok_or_else(|| VctError::cluster_not_found(cluster))
}

/// Datacenter called `datacenter`.
pub fn require_datacenter<'v>(view: &'v ContainerView, datacenter: &str) -> VctResult<&'v InventoryNode> {
    resolve_by_name(view, datacenter)
        .filter(|n| n.kind == ObjectKind::Datacenter)
        .ok_or_else(|| VctError::not_found(format!("Datacenter '{datacenter}' not found")))
}

/// Names of the datastores attached to `cluster`, for prompting.
pub fn cluster_datastores(view: &ContainerView, cluster: &str) -> VctResult<Vec<String>> {
    let cluster = require_cluster(view, cluster)?;
    Ok(cluster.datastores().iter().map(|d| d.name.clone()).collect())
}

/// Names of the networks reachable from `cluster`, for prompting.
pub fn cluster_networks(view: &ContainerView, cluster: &str) -> VctResult<Vec<String>> {
    let cluster = require_cluster(view, cluster)?;
    Ok(cluster.networks().iter().map(|n| n.name.clone()).collect())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Datastore capacity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capacity and provisioning figures for one datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct DatastoreRecord {
    pub name: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub uncommitted_bytes: u64,
    /// capacity - free + uncommitted; may exceed capacity when over-provisioned
    pub provisioned_bytes: u64,
    pub provisioned_pct: f64,
    pub free_pct: f64,
}

impl DatastoreRecord {
    pub fn new(name: &str, capacity: u64, free: u64, uncommitted: Option<u64>) -> VctResult<Self> {
        if capacity == 0 {
            return Err(VctError::zero_capacity(name));
        }
        let uncommitted = uncommitted.unwrap_or(0);
        let provisioned = capacity.saturating_sub(free).saturating_add(uncommitted);
        Ok(Self {
            name: name.to_string(),
            capacity_bytes: capacity,
            free_bytes: free,
            uncommitted_bytes: uncommitted,
            provisioned_bytes: provisioned,
            provisioned_pct: provisioned as f64 / capacity as f64,
            free_pct: free as f64 / capacity as f64,
        })
    }

    /// Display cells matching [`CAPACITY_HEADER`].
    pub fn cells(&self) -> [String; 6] {
        [
            self.name.clone(),
            disk_size_format(self.capacity_bytes),
            disk_size_format(self.provisioned_bytes),
            percent_format(self.provisioned_pct),
            disk_size_format(self.free_bytes),
            percent_format(self.free_pct),
        ]
    }
}

/// A row of a capacity report.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityRow {
    Header,
    Datastore(DatastoreRecord),
}

impl CapacityRow {
    pub fn cells(&self) -> [String; 6] {
        match self {
            Self::Header => CAPACITY_HEADER.map(String::from),
            Self::Datastore(record) => record.cells(),
        }
    }

    pub fn record(&self) -> Option<&DatastoreRecord> {
        match self {
            Self::Header => None,
            Self::Datastore(record) => Some(record),
        }
    }
}

fn capacity_records(cluster: &InventoryNode) -> VctResult<Vec<DatastoreRecord>> {
    cluster
        .datastores()
        .iter()
        .filter_map(|ds| ds.datastore_summary().map(|s| (ds, s)))
        .filter(|(_, s)| s.fs_type.eq_ignore_ascii_case(CAPACITY_FS_TYPE))
        .map(|(ds, s)| DatastoreRecord::new(&ds.name, s.capacity, s.free_space, s.uncommitted))
        .collect()
}

/// Capacity report for the VMFS datastores of `cluster`, sorted by name,
/// optionally led by a header row.
pub fn datastore_capacity(
    view: &ContainerView,
    cluster: &str,
    include_header: bool,
) -> VctResult<Vec<CapacityRow>> {
    let cluster = require_cluster(view, cluster)?;
    let mut records = capacity_records(cluster)?;
    records.sort_by(|a, b| a.name.cmp(&b.name));

    let mut rows = Vec::with_capacity(records.len() + 1);
    if include_header {
        rows.push(CapacityRow::Header);
    }
    rows.extend(records.into_iter().map(CapacityRow::Datastore));
    Ok(rows)
}

/// VMFS datastore of `cluster` with the most free space.
pub fn datastore_most_free(view: &ContainerView, cluster: &str) -> VctResult<Option<String>> {
    let cluster = require_cluster(view, cluster)?;
    let best = cluster
        .datastores()
        .iter()
        .filter_map(|ds| ds.datastore_summary().map(|s| (ds, s)))
        .filter(|(_, s)| s.fs_type.eq_ignore_ascii_case(CAPACITY_FS_TYPE))
        .max_by_key(|(_, s)| s.free_space)
        .map(|(ds, _)| ds.name.clone());
    Ok(best)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM folders / VMs below a datacenter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Find a VM folder by name, searching top-level folders and their direct
/// sub-folders. Also accepts the `parent -> child` display form.
pub fn lookup_folder<'v>(
    view: &'v ContainerView,
    datacenter: &str,
    name: &str,
) -> Option<&'v InventoryNode> {
    let vm_root = resolve_by_name(view, datacenter)?.vm_folder()?;

    if let Some((parent, child)) = name.split_once(" -> ") {
        return vm_root
            .children
            .iter()
            .filter(|f| f.is_folder() && f.name == parent)
            .flat_map(|f| f.children.iter())
            .find(|item| item.is_folder() && item.name == child);
    }

    for folder in &vm_root.children {
        if folder.is_folder() && folder.name == name {
            return Some(folder);
        }
        if let Some(item) = folder.children.iter().find(|i| i.is_folder() && i.name == name) {
            return Some(item);
        }
    }
    None
}

/// Display names of the VM folders of `datacenter`: top-level folders as
/// their name, one level of sub-folders as `parent -> child`.
pub fn list_vm_folders(view: &ContainerView, datacenter: &str) -> VctResult<Vec<String>> {
    let dc = require_datacenter(view, datacenter)?;
    let mut folders = Vec::new();
    let Some(vm_root) = dc.vm_folder() else {
        return Ok(folders);
    };

    for folder in &vm_root.children {
        if folder.is_folder() {
            folders.push(folder.name.clone());
        }
        for item in folder.children.iter().filter(|i| i.is_folder()) {
            let parent = item
                .parent
                .as_ref()
                .map(|p| p.name.as_str())
                .unwrap_or(folder.name.as_str());
            folders.push(format!("{parent} -> {}", item.name));
        }
    }
    Ok(folders)
}

/// VM name → managed object id for VMs at the VM root or one folder down.
pub fn list_vms(view: &ContainerView, datacenter: &str) -> VctResult<BTreeMap<String, String>> {
    let dc = require_datacenter(view, datacenter)?;
    let mut vms = BTreeMap::new();
    let Some(vm_root) = dc.vm_folder() else {
        return Ok(vms);
    };

    for entity in &vm_root.children {
        if entity.kind == ObjectKind::VirtualMachine {
            vms.insert(entity.name.clone(), entity.moref.value.clone());
        }
        for vm in entity.children.iter().filter(|c| c.kind == ObjectKind::VirtualMachine) {
            vms.insert(vm.name.clone(), vm.moref.value.clone());
        }
    }
    Ok(vms)
}

/// Managed object id of the VM called `name`.
pub fn vm_id_by_name(view: &ContainerView, datacenter: &str, name: &str) -> VctResult<Option<String>> {
    Ok(list_vms(view, datacenter)?.remove(name))
}
