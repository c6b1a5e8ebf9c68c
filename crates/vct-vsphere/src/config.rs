//! VM create / reconfigure / power orchestration.
//!
//! [`VmConfigurator`] ties the other pieces together: it resolves names
//! through [`InventoryIndex`], checks device batches for key linkage,
//! submits the request and waits for the task with [`TaskMonitor`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::devices::{
    validate_device_batch, DeviceSpec, DeviceSpecBuilder, OpticalDriveOptions,
    DEFAULT_CDROM_CONTROLLER_KEY,
};
use crate::error::{VctError, VctResult};
use crate::inventory::{lookup_folder, require_datacenter, resolve_by_name, vm_id_by_name, InventoryIndex};
use crate::remote::RemoteSession;
use crate::task::{MonitorOptions, QuestionResolver, TaskMonitor, TaskReport};
use crate::types::{InventoryNode, LiveDevice, ManagedObjectRef, ObjectKind, PowerAction};

// ─── Config spec ─────────────────────────────────────────────────────────────

/// `VirtualMachineConfigSpec` as sent to `CreateVM_Task` / `ReconfigVM_Task`.
/// Unset fields are left untouched by a reconfigure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_typeName", rename = "VirtualMachineConfigSpec", rename_all = "camelCase")]
pub struct VmConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "numCPUs", skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,
    #[serde(default, rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<VmFileInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName", rename = "VirtualMachineFileInfo", rename_all = "camelCase")]
pub struct VmFileInfo {
    /// `[datastore]` lets the endpoint choose the VM directory.
    pub vm_path_name: String,
}

impl VmFileInfo {
    pub fn on_datastore(datastore: &str) -> Self {
        Self { vm_path_name: format!("[{datastore}]") }
    }
}

impl VmConfigSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.num_cpus = Some(cpus);
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn with_guest_id(mut self, guest_id: impl Into<String>) -> Self {
        self.guest_id = Some(guest_id.into());
        self
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn with_device(mut self, spec: DeviceSpec) -> Self {
        self.device_change.push(spec);
        self
    }

    pub fn with_devices(mut self, specs: impl IntoIterator<Item = DeviceSpec>) -> Self {
        self.device_change.extend(specs);
        self
    }
}

/// Where a new VM goes, resolved from names.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub folder: ManagedObjectRef,
    pub pool: ManagedObjectRef,
    /// The cluster's datastores, for [`DeviceSpecBuilder::add_disk`]
    pub datastores: Vec<InventoryNode>,
    /// The cluster's networks, for [`DeviceSpecBuilder::add_nic`]
    pub networks: Vec<InventoryNode>,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct VmConfigurator<'a> {
    session: &'a dyn RemoteSession,
    resolver: &'a dyn QuestionResolver,
    options: MonitorOptions,
}

impl<'a> VmConfigurator<'a> {
    pub fn new(
        session: &'a dyn RemoteSession,
        resolver: &'a dyn QuestionResolver,
        options: MonitorOptions,
    ) -> Self {
        Self { session, resolver, options }
    }

    fn monitor(&self) -> TaskMonitor<'_> {
        TaskMonitor::new(self.session, self.resolver, self.options.clone())
    }

    fn index(&self) -> InventoryIndex<'_> {
        InventoryIndex::new(self.session)
    }

    // ── Name resolution ─────────────────────────────────────────────

    /// Resolve a VM folder (the datacenter's VM root when `folder` is
    /// `None`) and a cluster's resource pool.
    pub async fn placement(
        &self,
        datacenter: &str,
        cluster: &str,
        folder: Option<&str>,
    ) -> VctResult<Placement> {
        let dcs = self.index().datacenters().await?;
        let folder = match folder {
            Some(name) => lookup_folder(&dcs, datacenter, name)
                .ok_or_else(|| VctError::not_found(format!("Folder '{name}' not found in '{datacenter}'")))?,
            None => require_datacenter(&dcs, datacenter)?
                .vm_folder()
                .ok_or_else(|| VctError::not_found(format!("Datacenter '{datacenter}' has no VM folder")))?,
        };

        let clusters = self.index().clusters().await?;
        let cluster_node = resolve_by_name(&clusters, cluster)
            .filter(|n| n.kind == ObjectKind::ComputeResource)
            .ok_or_else(|| VctError::cluster_not_found(cluster))?;
        let pool = cluster_node
            .resource_pool()
            .cloned()
            .ok_or_else(|| VctError::not_found(format!("Cluster '{cluster}' has no resource pool")))?;

        Ok(Placement {
            folder: folder.moref.clone(),
            pool,
            datastores: cluster_node.datastores().to_vec(),
            networks: cluster_node.networks().to_vec(),
        })
    }

    /// Managed object reference of the VM called `name`.
    pub async fn find_vm(&self, datacenter: &str, name: &str) -> VctResult<ManagedObjectRef> {
        let dcs = self.index().datacenters().await?;
        vm_id_by_name(&dcs, datacenter, name)?
            .map(|id| ManagedObjectRef::new("VirtualMachine", id))
            .ok_or_else(|| VctError::not_found(format!("VM '{name}' not found in '{datacenter}'")))
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Create a VM with its files on `datastore`. Questions are not
    /// answered: the VM does not exist yet.
    pub async fn create(
        &self,
        folder: &ManagedObjectRef,
        datastore: &str,
        pool: &ManagedObjectRef,
        mut config: VmConfigSpec,
    ) -> VctResult<TaskReport> {
        config.files = Some(VmFileInfo::on_datastore(datastore));
        validate_device_batch(&config.device_change, &BTreeSet::new())?;

        log::debug!(
            "Creating VM {:?} in {folder} on [{datastore}] with {} device change(s)",
            config.name,
            config.device_change.len()
        );
        let task = self.session.create_vm(folder, pool, &config).await?;
        self.monitor().monitor(&task, false, None).await
    }

    /// Apply `config` to an existing VM.
    pub async fn reconfig(&self, vm: &ManagedObjectRef, config: VmConfigSpec) -> VctResult<TaskReport> {
        let live = self.session.live_devices(vm).await?;
        self.submit_reconfig(vm, config, &live).await
    }

    async fn submit_reconfig(
        &self,
        vm: &ManagedObjectRef,
        config: VmConfigSpec,
        live: &[LiveDevice],
    ) -> VctResult<TaskReport> {
        let live_keys: BTreeSet<i32> = live.iter().map(|d| d.key).collect();
        validate_device_batch(&config.device_change, &live_keys)?;

        log::debug!("Reconfiguring {vm} with {} device change(s)", config.device_change.len());
        let task = self.session.reconfigure_vm(vm, &config).await?;
        self.monitor().monitor(&task, true, Some(vm)).await
    }

    /// Power operation. Guest reboot and shutdown finish without a remote
    /// task and report success straight away.
    pub async fn power(&self, vm: &ManagedObjectRef, action: PowerAction) -> VctResult<TaskReport> {
        log::debug!("{} on {vm}", action.method());
        match self.session.power(vm, action).await? {
            Some(task) => self.monitor().monitor(&task, true, Some(vm)).await,
            None => {
                let report = TaskReport::immediate_success();
                log::info!("{report}");
                Ok(report)
            }
        }
    }

    /// Builder seeded with the VM's current devices.
    pub async fn device_builder(&self, vm: &ManagedObjectRef) -> VctResult<DeviceSpecBuilder> {
        let live = self.session.live_devices(vm).await?;
        Ok(DeviceSpecBuilder::from_live_devices(&live))
    }

    /// Point the VM's first optical drive at an ISO.
    pub async fn mount_iso(
        &self,
        vm: &ManagedObjectRef,
        datastore: &str,
        iso_path: &str,
        iso_name: &str,
    ) -> VctResult<TaskReport> {
        self.reconfigure_optical(vm, OpticalDriveOptions::mount(datastore, iso_path, iso_name))
            .await
    }

    /// Switch the VM's first optical drive back to passthrough.
    pub async fn unmount_iso(&self, vm: &ManagedObjectRef) -> VctResult<TaskReport> {
        self.reconfigure_optical(vm, OpticalDriveOptions::unmount()).await
    }

    async fn reconfigure_optical(
        &self,
        vm: &ManagedObjectRef,
        opts: OpticalDriveOptions,
    ) -> VctResult<TaskReport> {
        let live = self.session.live_devices(vm).await?;
        let opts = match live.iter().find(|d| d.is_optical()) {
            Some(drive) => {
                let ctrl = drive.controller_key.unwrap_or(DEFAULT_CDROM_CONTROLLER_KEY);
                opts.with_keys(drive.key, ctrl)
            }
            None => opts,
        };
        let spec = DeviceSpecBuilder::from_live_devices(&live).optical_drive(&opts)?;
        self.submit_reconfig(vm, VmConfigSpec::default().with_device(spec), &live)
            .await
    }
}
