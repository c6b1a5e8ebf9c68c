//! Virtual device descriptors and the builder that keeps their keys linked.
//!
//! Every descriptor is a `VirtualDeviceConfigSpec` ready to be placed in a
//! VM config's `deviceChange` list. New devices get negative placeholder
//! keys that the endpoint replaces on commit; disks and optical drives
//! point at their controller through `controllerKey`, so a
//! [`DeviceSpecBuilder`] tracks which keys exist in the current build
//! session and refuses descriptors that reference anything else.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{VctError, VctResult};
use crate::inventory::find_named;
use crate::types::{InventoryNode, LiveDevice, ManagedObjectRef, ObjectKind};

/// Key of the first optical drive on a freshly created VM.
pub const DEFAULT_CDROM_KEY: i32 = 3002;
/// Secondary IDE controller, home of the first optical drive.
pub const DEFAULT_CDROM_CONTROLLER_KEY: i32 = 201;
/// IDE controllers present on every VM.
pub const CONVENTIONAL_CONTROLLER_KEYS: [i32; 2] = [200, DEFAULT_CDROM_CONTROLLER_KEY];

const SCSI_RESERVED_UNIT: i32 = 7;
const SCSI_MAX_UNIT: i32 = 63;
const SCSI_MAX_BUS: i32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Descriptor model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOperation {
    Add,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharedBus {
    NoSharing,
    VirtualSharing,
    PhysicalSharing,
}

impl Default for SharedBus {
    fn default() -> Self { Self::NoSharing }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    Nonpersistent,
    IndependentPersistent,
    IndependentNonpersistent,
}

impl Default for DiskMode {
    fn default() -> Self { Self::Persistent }
}

/// Broad device category, independent of the concrete remote type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    ScsiController,
    Disk,
    NetworkInterface,
    OpticalDrive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    pub connected: bool,
    pub start_connected: bool,
    pub allow_guest_control: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self { connected: true, start_connected: true, allow_guest_control: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScsiControllerDevice {
    pub key: i32,
    pub bus_number: i32,
    pub shared_bus: SharedBus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDevice {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: i32,
    #[serde(rename = "capacityInKB")]
    pub capacity_in_kb: u64,
    pub backing: DiskBacking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum DiskBacking {
    #[serde(rename = "VirtualDiskFlatVer2BackingInfo")]
    FlatVer2(FlatVer2Backing),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatVer2Backing {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<ManagedObjectRef>,
    pub disk_mode: DiskMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_provisioned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eagerly_scrub: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthernetCardDevice {
    pub key: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    pub backing: EthernetBacking,
    pub connectable: ConnectInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum EthernetBacking {
    #[serde(rename = "VirtualEthernetCardNetworkBackingInfo", rename_all = "camelCase")]
    Network {
        device_name: String,
        network: ManagedObjectRef,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdromDevice {
    pub key: i32,
    pub controller_key: i32,
    pub backing: CdromBacking,
    pub connectable: ConnectInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum CdromBacking {
    #[serde(rename = "VirtualCdromRemotePassthroughBackingInfo", rename_all = "camelCase")]
    RemotePassthrough {
        device_name: String,
        exclusive: bool,
    },
    #[serde(rename = "VirtualCdromIsoBackingInfo", rename_all = "camelCase")]
    Iso {
        file_name: String,
    },
}

impl CdromBacking {
    fn passthrough() -> Self {
        Self::RemotePassthrough { device_name: String::new(), exclusive: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum VirtualDevice {
    #[serde(rename = "ParaVirtualSCSIController")]
    ScsiController(ScsiControllerDevice),
    #[serde(rename = "VirtualDisk")]
    Disk(DiskDevice),
    #[serde(rename = "VirtualVmxnet3")]
    Vmxnet3(EthernetCardDevice),
    #[serde(rename = "VirtualCdrom")]
    Cdrom(CdromDevice),
}

/// One entry of a config spec's `deviceChange` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceSpec {
    fn new(operation: DeviceOperation, device: VirtualDevice) -> Self {
        Self { operation, file_operation: None, device }
    }

    pub fn kind(&self) -> DeviceKind {
        match self.device {
            VirtualDevice::ScsiController(_) => DeviceKind::ScsiController,
            VirtualDevice::Disk(_) => DeviceKind::Disk,
            VirtualDevice::Vmxnet3(_) => DeviceKind::NetworkInterface,
            VirtualDevice::Cdrom(_) => DeviceKind::OpticalDrive,
        }
    }

    pub fn key(&self) -> i32 {
        match &self.device {
            VirtualDevice::ScsiController(d) => d.key,
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::Vmxnet3(d) => d.key,
            VirtualDevice::Cdrom(d) => d.key,
        }
    }

    pub fn controller_key(&self) -> Option<i32> {
        match &self.device {
            VirtualDevice::ScsiController(_) => None,
            VirtualDevice::Disk(d) => Some(d.controller_key),
            VirtualDevice::Vmxnet3(d) => d.controller_key,
            VirtualDevice::Cdrom(d) => Some(d.controller_key),
        }
    }

    /// File behind a disk or mounted ISO, if any.
    pub fn backing_file_name(&self) -> Option<&str> {
        match &self.device {
            VirtualDevice::Disk(DiskDevice { backing: DiskBacking::FlatVer2(b), .. }) => {
                Some(b.file_name.as_str())
            }
            VirtualDevice::Cdrom(CdromDevice { backing: CdromBacking::Iso { file_name }, .. }) => {
                Some(file_name.as_str())
            }
            _ => None,
        }
    }

    /// Controller key that must resolve to an existing controller.
    fn linked_controller(&self) -> Option<i32> {
        match self.kind() {
            DeviceKind::Disk | DeviceKind::OpticalDrive => self.controller_key(),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optical drive request. What is built depends on which fields are set:
/// nothing → add a passthrough drive; `unmount` → switch back to
/// passthrough; datastore + path + name → mount that ISO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpticalDriveOptions {
    pub datastore: Option<String>,
    pub iso_path: Option<String>,
    pub iso_name: Option<String>,
    pub unmount: bool,
    /// Defaults to [`DEFAULT_CDROM_KEY`]
    pub key: Option<i32>,
    /// Defaults to [`DEFAULT_CDROM_CONTROLLER_KEY`]
    pub controller_key: Option<i32>,
}

impl OpticalDriveOptions {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn unmount() -> Self {
        Self { unmount: true, ..Self::default() }
    }

    pub fn mount(
        datastore: impl Into<String>,
        iso_path: impl Into<String>,
        iso_name: impl Into<String>,
    ) -> Self {
        Self {
            datastore: Some(datastore.into()),
            iso_path: Some(iso_path.into()),
            iso_name: Some(iso_name.into()),
            ..Self::default()
        }
    }

    pub fn with_keys(mut self, key: i32, controller_key: i32) -> Self {
        self.key = Some(key);
        self.controller_key = Some(controller_key);
        self
    }
}

/// New VMDK to create on a datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDisk {
    pub datastore: String,
    pub size_kb: u64,
    pub controller_key: i32,
    pub unit_number: i32,
    /// Default true
    pub thin: bool,
    pub mode: DiskMode,
}

impl NewDisk {
    pub fn new(datastore: impl Into<String>, size_kb: u64, controller_key: i32, unit_number: i32) -> Self {
        Self {
            datastore: datastore.into(),
            size_kb,
            controller_key,
            unit_number,
            thin: true,
            mode: DiskMode::default(),
        }
    }

    pub fn thick(mut self) -> Self {
        self.thin = false;
        self
    }

    pub fn with_mode(mut self, mode: DiskMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Capacity change for a disk that already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskResize {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: i32,
    pub filename: String,
    pub size_kb: u64,
    pub mode: DiskMode,
}

/// Network interface settings; connectable flags default to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicParams {
    pub network: String,
    pub connected: bool,
    pub start_connected: bool,
    pub allow_guest_control: bool,
}

impl NicParams {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            connected: true,
            start_connected: true,
            allow_guest_control: true,
        }
    }

    fn connect_info(&self) -> ConnectInfo {
        ConnectInfo {
            connected: self.connected,
            start_connected: self.start_connected,
            allow_guest_control: self.allow_guest_control,
        }
    }
}

// ── Guest IP customization ──────────────────────────────────────────

/// How the guest OS gets its address on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpAssignment {
    Dhcp,
    Static {
        ip_address: String,
        subnet_mask: String,
        gateway: String,
        domain: Option<String>,
        dns_servers: Vec<String>,
    },
}

impl IpAssignment {
    pub fn static_ip(
        ip_address: impl Into<String>,
        subnet_mask: impl Into<String>,
        gateway: impl Into<String>,
    ) -> Self {
        Self::Static {
            ip_address: ip_address.into(),
            subnet_mask: subnet_mask.into(),
            gateway: gateway.into(),
            domain: None,
            dns_servers: Vec::new(),
        }
    }

    /// Set the DNS domain. No-op for DHCP.
    pub fn with_domain(mut self, value: impl Into<String>) -> Self {
        if let Self::Static { domain, .. } = &mut self {
            *domain = Some(value.into());
        }
        self
    }

    /// Append a DNS server. No-op for DHCP.
    pub fn with_dns(mut self, server: impl Into<String>) -> Self {
        if let Self::Static { dns_servers, .. } = &mut self {
            dns_servers.push(server.into());
        }
        self
    }

    /// Adapter mapping for a customization spec's `nicSettingMap`.
    pub fn adapter_mapping(&self) -> VctResult<AdapterMapping> {
        let adapter = match self {
            Self::Dhcp => IpSettings {
                ip: IpGenerator::Dhcp,
                subnet_mask: None,
                gateway: Vec::new(),
                dns_domain: None,
                dns_server_list: Vec::new(),
            },
            Self::Static { ip_address, subnet_mask, gateway, domain, dns_servers } => {
                check_ipv4(ip_address, "IP address")?;
                check_ipv4(subnet_mask, "Subnet mask")?;
                check_ipv4(gateway, "Gateway")?;
                for server in dns_servers {
                    check_ipv4(server, "DNS server")?;
                }
                IpSettings {
                    ip: IpGenerator::Fixed { ip_address: ip_address.clone() },
                    subnet_mask: Some(subnet_mask.clone()),
                    gateway: vec![gateway.clone()],
                    dns_domain: domain.clone().filter(|d| !d.is_empty()),
                    dns_server_list: dns_servers.clone(),
                }
            }
        };
        Ok(AdapterMapping { mac_address: None, adapter })
    }
}

fn check_ipv4(value: &str, what: &str) -> VctResult<()> {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| VctError::invalid_device(format!("{what} '{value}' is not a valid IPv4 address")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName", rename = "CustomizationAdapterMapping", rename_all = "camelCase")]
pub struct AdapterMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub adapter: IpSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName", rename = "CustomizationIPSettings", rename_all = "camelCase")]
pub struct IpSettings {
    pub ip: IpGenerator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_server_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum IpGenerator {
    #[serde(rename = "CustomizationDhcpIpGenerator")]
    Dhcp,
    #[serde(rename = "CustomizationFixedIp", rename_all = "camelCase")]
    Fixed { ip_address: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One build session. Placeholder keys count down from -1 and are never
/// reused by the same builder.
#[derive(Debug, Clone)]
pub struct DeviceSpecBuilder {
    next_placeholder: i32,
    issued: BTreeSet<i32>,
    scsi_controllers: BTreeSet<i32>,
    scsi_buses: BTreeSet<i32>,
    live: BTreeSet<i32>,
    used_slots: BTreeSet<(i32, i32)>,
}

impl Default for DeviceSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSpecBuilder {
    /// Builder for a VM that does not exist yet.
    pub fn new() -> Self {
        Self {
            next_placeholder: -1,
            issued: BTreeSet::new(),
            scsi_controllers: BTreeSet::new(),
            scsi_buses: BTreeSet::new(),
            live: BTreeSet::new(),
            used_slots: BTreeSet::new(),
        }
    }

    /// Builder for an existing VM whose device keys are already known.
    pub fn with_live_keys(keys: impl IntoIterator<Item = i32>) -> Self {
        let mut builder = Self::new();
        builder.live.extend(keys);
        builder
    }

    /// Builder seeded from a VM's current hardware list.
    pub fn from_live_devices(devices: &[LiveDevice]) -> Self {
        let mut builder = Self::with_live_keys(devices.iter().map(|d| d.key));
        for d in devices {
            if let (Some(ctrl), Some(unit)) = (d.controller_key, d.unit_number) {
                builder.used_slots.insert((ctrl, unit));
            }
        }
        builder
    }

    pub fn live_keys(&self) -> &BTreeSet<i32> {
        &self.live
    }

    fn next_key(&mut self) -> i32 {
        let key = self.next_placeholder;
        self.next_placeholder -= 1;
        self.issued.insert(key);
        key
    }

    fn is_known_key(&self, key: i32) -> bool {
        self.issued.contains(&key)
            || self.live.contains(&key)
            || key == DEFAULT_CDROM_KEY
            || CONVENTIONAL_CONTROLLER_KEYS.contains(&key)
    }

    fn check_controller(&self, controller_key: i32, what: &str) -> VctResult<()> {
        if self.scsi_controllers.contains(&controller_key)
            || self.live.contains(&controller_key)
            || CONVENTIONAL_CONTROLLER_KEYS.contains(&controller_key)
        {
            Ok(())
        } else {
            Err(VctError::key_linkage(format!(
                "{what} references controller key {controller_key}, which is neither a controller built in this session nor present on the VM"
            )))
        }
    }

    fn check_existing(&self, key: i32, what: &str) -> VctResult<()> {
        if self.is_known_key(key) {
            Ok(())
        } else {
            Err(VctError::key_linkage(format!(
                "{what} edits device key {key}, which was never issued or reported by the VM"
            )))
        }
    }

    /// Add a paravirtual SCSI controller. Returns its placeholder key so
    /// disks can attach to it.
    pub fn scsi_controller(
        &mut self,
        bus_number: i32,
        shared_bus: SharedBus,
    ) -> VctResult<(i32, DeviceSpec)> {
        if !(0..=SCSI_MAX_BUS).contains(&bus_number) {
            return Err(VctError::invalid_device(format!(
                "SCSI bus number {bus_number} out of range 0-{SCSI_MAX_BUS}"
            )));
        }
        if !self.scsi_buses.insert(bus_number) {
            return Err(VctError::invalid_device(format!(
                "SCSI bus {bus_number} already has a controller in this batch"
            )));
        }

        let key = self.next_key();
        self.scsi_controllers.insert(key);
        let spec = DeviceSpec::new(
            DeviceOperation::Add,
            VirtualDevice::ScsiController(ScsiControllerDevice { key, bus_number, shared_bus }),
        );
        Ok((key, spec))
    }

    /// Create, unmount or mount an optical drive; see [`OpticalDriveOptions`].
    pub fn optical_drive(&mut self, opts: &OpticalDriveOptions) -> VctResult<DeviceSpec> {
        let key = opts.key.unwrap_or(DEFAULT_CDROM_KEY);
        let controller_key = opts.controller_key.unwrap_or(DEFAULT_CDROM_CONTROLLER_KEY);
        self.check_controller(controller_key, "Optical drive")?;

        let cdrom = |backing| {
            VirtualDevice::Cdrom(CdromDevice {
                key,
                controller_key,
                backing,
                connectable: ConnectInfo::default(),
            })
        };

        if opts.unmount {
            self.check_existing(key, "Optical drive unmount")?;
            return Ok(DeviceSpec::new(DeviceOperation::Edit, cdrom(CdromBacking::passthrough())));
        }

        let present = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_owned);
        match (present(&opts.datastore), present(&opts.iso_path), present(&opts.iso_name)) {
            (Some(datastore), Some(path), Some(name)) => {
                self.check_existing(key, "ISO mount")?;
                let file_name = format!("[{datastore}] {}", normalize_iso_path(&path, &name));
                Ok(DeviceSpec::new(DeviceOperation::Edit, cdrom(CdromBacking::Iso { file_name })))
            }
            (None, None, None) => {
                if self.live.contains(&key) || !self.issued.insert(key) {
                    return Err(VctError::key_linkage(format!(
                        "Optical drive key {key} is already in use; pass a different key"
                    )));
                }
                Ok(DeviceSpec::new(DeviceOperation::Add, cdrom(CdromBacking::passthrough())))
            }
            _ => Err(VctError::invalid_device(
                "Mounting an ISO needs datastore, path and file name together",
            )),
        }
    }

    /// New thin/thick VMDK on `datastore`, resolved from `datastores`.
    pub fn add_disk(&mut self, params: &NewDisk, datastores: &[InventoryNode]) -> VctResult<DeviceSpec> {
        if params.size_kb == 0 {
            return Err(VctError::invalid_device("Disk size must be greater than zero"));
        }
        self.check_controller(params.controller_key, "Disk")?;
        let datastore = find_named(datastores, &params.datastore)
            .filter(|n| n.kind == ObjectKind::Datastore)
            .ok_or_else(|| VctError::not_found(format!("Datastore '{}' not found", params.datastore)))?;

        // Claimed last so a failed lookup leaves the slot free for a retry.
        self.claim_slot(params.controller_key, params.unit_number)?;
        let key = self.next_key();
        let mut spec = DeviceSpec::new(
            DeviceOperation::Add,
            VirtualDevice::Disk(DiskDevice {
                key,
                controller_key: params.controller_key,
                unit_number: params.unit_number,
                capacity_in_kb: params.size_kb,
                backing: DiskBacking::FlatVer2(FlatVer2Backing {
                    // The endpoint fills in the folder and file name.
                    file_name: format!("[{}]", params.datastore),
                    datastore: Some(datastore.moref.clone()),
                    disk_mode: params.mode,
                    thin_provisioned: Some(params.thin),
                    eagerly_scrub: Some(false),
                }),
            }),
        );
        spec.file_operation = Some(FileOperation::Create);
        Ok(spec)
    }

    /// Grow an existing disk. Only the capacity changes.
    pub fn edit_disk(&mut self, params: &DiskResize) -> VctResult<DeviceSpec> {
        if params.size_kb == 0 {
            return Err(VctError::invalid_device("Disk size must be greater than zero"));
        }
        if params.filename.trim().is_empty() {
            return Err(VctError::invalid_device("Editing a disk needs its backing file name"));
        }
        self.check_existing(params.key, "Disk edit")?;
        self.check_controller(params.controller_key, "Disk")?;

        Ok(DeviceSpec::new(
            DeviceOperation::Edit,
            VirtualDevice::Disk(DiskDevice {
                key: params.key,
                controller_key: params.controller_key,
                unit_number: params.unit_number,
                capacity_in_kb: params.size_kb,
                backing: DiskBacking::FlatVer2(FlatVer2Backing {
                    file_name: params.filename.clone(),
                    datastore: None,
                    disk_mode: params.mode,
                    thin_provisioned: None,
                    eagerly_scrub: None,
                }),
            }),
        ))
    }

    /// New vmxnet3 interface bound to a network resolved from `networks`.
    pub fn add_nic(&mut self, params: &NicParams, networks: &[InventoryNode]) -> VctResult<DeviceSpec> {
        let backing = Self::network_backing(&params.network, networks)?;
        let key = self.next_key();
        Ok(DeviceSpec::new(
            DeviceOperation::Add,
            VirtualDevice::Vmxnet3(EthernetCardDevice {
                key,
                controller_key: None,
                backing,
                connectable: params.connect_info(),
            }),
        ))
    }

    /// Rebind or reconnect an existing interface.
    pub fn edit_nic(
        &mut self,
        key: i32,
        controller_key: i32,
        params: &NicParams,
        networks: &[InventoryNode],
    ) -> VctResult<DeviceSpec> {
        self.check_existing(key, "Network interface edit")?;
        let backing = Self::network_backing(&params.network, networks)?;
        Ok(DeviceSpec::new(
            DeviceOperation::Edit,
            VirtualDevice::Vmxnet3(EthernetCardDevice {
                key,
                controller_key: Some(controller_key),
                backing,
                connectable: params.connect_info(),
            }),
        ))
    }

    fn network_backing(name: &str, networks: &[InventoryNode]) -> VctResult<EthernetBacking> {
        let network = find_named(networks, name)
            .ok_or_else(|| VctError::not_found(format!("Network '{name}' not found")))?;
        Ok(EthernetBacking::Network {
            device_name: name.to_string(),
            network: network.moref.clone(),
        })
    }

    fn claim_slot(&mut self, controller_key: i32, unit_number: i32) -> VctResult<()> {
        if unit_number == SCSI_RESERVED_UNIT {
            return Err(VctError::invalid_device(format!(
                "Unit {SCSI_RESERVED_UNIT} is reserved for the SCSI controller itself"
            )));
        }
        if !(0..=SCSI_MAX_UNIT).contains(&unit_number) {
            return Err(VctError::invalid_device(format!(
                "Unit number {unit_number} out of range 0-{SCSI_MAX_UNIT}"
            )));
        }
        if !self.used_slots.insert((controller_key, unit_number)) {
            return Err(VctError::invalid_device(format!(
                "Controller {controller_key} unit {unit_number} is already taken"
            )));
        }
        Ok(())
    }
}

/// Datastore-relative ISO path: `name` is appended unless `path` already
/// names an `.iso`, and leading separators are dropped.
pub fn normalize_iso_path(path: &str, name: &str) -> String {
    let full = if path.ends_with(".iso") {
        path.to_string()
    } else if path.ends_with('/') {
        format!("{path}{name}")
    } else {
        format!("{path}/{name}")
    };
    full.trim_start_matches('/').to_string()
}

/// Re-check an assembled `deviceChange` list before it is submitted.
///
/// `live_keys` are the keys of devices already on the target VM (empty for
/// a VM being created). Keys of added devices must be unique, every disk and
/// optical drive must hang off a controller added in the batch or present
/// on the VM, and edits must name devices that exist.
pub fn validate_device_batch(specs: &[DeviceSpec], live_keys: &BTreeSet<i32>) -> VctResult<()> {
    let mut added = BTreeSet::new();
    let mut controllers: BTreeSet<i32> = live_keys.clone();
    controllers.extend(CONVENTIONAL_CONTROLLER_KEYS);

    for spec in specs.iter().filter(|s| s.operation == DeviceOperation::Add) {
        let key = spec.key();
        if !added.insert(key) {
            return Err(VctError::key_linkage(format!(
                "Key {key} is used by more than one new device"
            )));
        }
        if spec.kind() == DeviceKind::ScsiController {
            controllers.insert(key);
        }
    }

    for spec in specs {
        if let Some(ctrl) = spec.linked_controller() {
            if !controllers.contains(&ctrl) {
                return Err(VctError::key_linkage(format!(
                    "{:?} device {} references unknown controller key {ctrl}",
                    spec.kind(),
                    spec.key()
                )));
            }
        }
        if spec.operation == DeviceOperation::Edit {
            let key = spec.key();
            if !(added.contains(&key) || live_keys.contains(&key) || key == DEFAULT_CDROM_KEY) {
                return Err(VctError::key_linkage(format!(
                    "Edit of {:?} device references unknown key {key}",
                    spec.kind()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VctErrorKind;
    use crate::types::{DatastoreSummary, NodeDetail};

    fn datastores() -> Vec<InventoryNode> {
        vec![InventoryNode::new(ManagedObjectRef::new("Datastore", "datastore-11"), "ds1")
            .with_detail(NodeDetail::Datastore(DatastoreSummary {
                name: "ds1".into(),
                capacity: 1 << 40,
                free_space: 1 << 39,
                fs_type: "VMFS".into(),
                ..Default::default()
            }))]
    }

    fn networks() -> Vec<InventoryNode> {
        vec![
            InventoryNode::new(ManagedObjectRef::new("Network", "network-5"), "VM Network"),
            InventoryNode::new(ManagedObjectRef::new("DistributedVirtualPortgroup", "dvportgroup-9"), "dmz"),
        ]
    }

    #[test]
    fn placeholder_keys_are_negative_and_distinct() {
        let mut b = DeviceSpecBuilder::new();
        let (k0, _) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let (k1, _) = b.scsi_controller(1, SharedBus::VirtualSharing).unwrap();
        let disk = b.add_disk(&NewDisk::new("ds1", 1024, k0, 0), &datastores()).unwrap();
        let nic = b.add_nic(&NicParams::new("VM Network"), &networks()).unwrap();

        let keys = [k0, k1, disk.key(), nic.key()];
        assert!(keys.iter().all(|k| *k < 0));
        let unique: BTreeSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn disk_on_session_controller_is_linked() {
        let mut b = DeviceSpecBuilder::new();
        let (k, scsi) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let disk = b.add_disk(&NewDisk::new("ds1", 10 * 1024 * 1024, k, 0), &datastores()).unwrap();

        assert_eq!(disk.controller_key(), Some(k));
        assert!(validate_device_batch(&[scsi, disk], &BTreeSet::new()).is_ok());
    }

    #[test]
    fn disk_on_unrelated_controller_is_rejected() {
        let mut b = DeviceSpecBuilder::new();
        b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let err = b.add_disk(&NewDisk::new("ds1", 1024, -42, 0), &datastores()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::KeyLinkageViolation);
    }

    #[test]
    fn new_disk_backing_is_datastore_root() {
        let mut b = DeviceSpecBuilder::new();
        let (k, _) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let disk = b.add_disk(&NewDisk::new("ds1", 2048, k, 1).thick(), &datastores()).unwrap();

        assert_eq!(disk.operation, DeviceOperation::Add);
        assert_eq!(disk.file_operation, Some(FileOperation::Create));
        match &disk.device {
            VirtualDevice::Disk(d) => {
                let DiskBacking::FlatVer2(backing) = &d.backing;
                assert_eq!(backing.file_name, "[ds1]");
                assert_eq!(backing.datastore.as_ref().map(|m| m.value.as_str()), Some("datastore-11"));
                assert_eq!(backing.thin_provisioned, Some(false));
                assert_eq!(backing.eagerly_scrub, Some(false));
                assert_eq!(d.capacity_in_kb, 2048);
                assert_eq!(d.unit_number, 1);
            }
            other => panic!("expected disk, got {other:?}"),
        }
    }

    #[test]
    fn unknown_datastore_is_not_found() {
        let mut b = DeviceSpecBuilder::new();
        let (k, _) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let err = b.add_disk(&NewDisk::new("ds-missing", 1024, k, 0), &datastores()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::ObjectNotFound);
    }

    #[test]
    fn reserved_and_duplicate_units_are_rejected() {
        let mut b = DeviceSpecBuilder::new();
        let (k, _) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let reserved = b.add_disk(&NewDisk::new("ds1", 1024, k, 7), &datastores()).unwrap_err();
        assert_eq!(reserved.kind, VctErrorKind::InvalidDeviceConfig);

        b.add_disk(&NewDisk::new("ds1", 1024, k, 0), &datastores()).unwrap();
        let dup = b.add_disk(&NewDisk::new("ds1", 1024, k, 0), &datastores()).unwrap_err();
        assert_eq!(dup.kind, VctErrorKind::InvalidDeviceConfig);
    }

    #[test]
    fn scsi_bus_range_and_reuse() {
        let mut b = DeviceSpecBuilder::new();
        assert!(b.scsi_controller(4, SharedBus::NoSharing).is_err());
        b.scsi_controller(2, SharedBus::PhysicalSharing).unwrap();
        assert!(b.scsi_controller(2, SharedBus::NoSharing).is_err());
    }

    #[test]
    fn edit_disk_needs_a_live_key() {
        let mut fresh = DeviceSpecBuilder::new();
        let resize = DiskResize {
            key: 2000,
            controller_key: 1000,
            unit_number: 0,
            filename: "[ds1] web01/web01.vmdk".into(),
            size_kb: 40 * 1024 * 1024,
            mode: DiskMode::Persistent,
        };
        assert_eq!(
            fresh.edit_disk(&resize).unwrap_err().kind,
            VctErrorKind::KeyLinkageViolation
        );

        let mut live = DeviceSpecBuilder::with_live_keys([1000, 2000]);
        let spec = live.edit_disk(&resize).unwrap();
        assert_eq!(spec.operation, DeviceOperation::Edit);
        assert_eq!(spec.key(), 2000);
        assert_eq!(spec.backing_file_name(), Some("[ds1] web01/web01.vmdk"));
        assert_eq!(spec.file_operation, None);
    }

    #[test]
    fn mount_iso_from_directory() {
        let mut b = DeviceSpecBuilder::new();
        let spec = b.optical_drive(&OpticalDriveOptions::mount("ds1", "/isos/", "rhel7.iso")).unwrap();
        assert_eq!(spec.operation, DeviceOperation::Edit);
        assert_eq!(spec.backing_file_name(), Some("[ds1] isos/rhel7.iso"));
        assert_eq!(spec.key(), DEFAULT_CDROM_KEY);
        assert_eq!(spec.controller_key(), Some(DEFAULT_CDROM_CONTROLLER_KEY));
    }

    #[test]
    fn mount_iso_with_full_path() {
        let mut b = DeviceSpecBuilder::new();
        let spec = b
            .optical_drive(&OpticalDriveOptions::mount("ds1", "/isos/rhel7.iso", "rhel7.iso"))
            .unwrap();
        assert_eq!(spec.backing_file_name(), Some("[ds1] isos/rhel7.iso"));
    }

    #[test]
    fn iso_path_normalisation() {
        assert_eq!(normalize_iso_path("isos", "a.iso"), "isos/a.iso");
        assert_eq!(normalize_iso_path("//isos/b/", "a.iso"), "isos/b/a.iso");
        assert_eq!(normalize_iso_path("/a.iso", "ignored.iso"), "a.iso");
    }

    #[test]
    fn create_and_unmount_use_passthrough() {
        let mut b = DeviceSpecBuilder::new();
        let created = b.optical_drive(&OpticalDriveOptions::create()).unwrap();
        assert_eq!(created.operation, DeviceOperation::Add);
        assert!(created.backing_file_name().is_none());

        let unmounted = b.optical_drive(&OpticalDriveOptions::unmount()).unwrap();
        assert_eq!(unmounted.operation, DeviceOperation::Edit);
        match unmounted.device {
            VirtualDevice::Cdrom(CdromDevice { backing: CdromBacking::RemotePassthrough { exclusive, .. }, .. }) => {
                assert!(!exclusive)
            }
            other => panic!("expected passthrough cdrom, got {other:?}"),
        }
    }

    #[test]
    fn partial_mount_request_is_rejected() {
        let mut b = DeviceSpecBuilder::new();
        let opts = OpticalDriveOptions {
            iso_path: Some("/isos/".into()),
            iso_name: Some("rhel7.iso".into()),
            ..Default::default()
        };
        assert_eq!(b.optical_drive(&opts).unwrap_err().kind, VctErrorKind::InvalidDeviceConfig);
    }

    #[test]
    fn optical_drive_on_unknown_controller() {
        let mut b = DeviceSpecBuilder::new();
        let opts = OpticalDriveOptions::create().with_keys(3000, 999);
        assert_eq!(b.optical_drive(&opts).unwrap_err().kind, VctErrorKind::KeyLinkageViolation);
    }

    #[test]
    fn nic_flags_and_backing() {
        let mut b = DeviceSpecBuilder::new();
        let params = NicParams { start_connected: false, ..NicParams::new("dmz") };
        let spec = b.add_nic(&params, &networks()).unwrap();
        match &spec.device {
            VirtualDevice::Vmxnet3(nic) => {
                assert!(nic.connectable.connected);
                assert!(!nic.connectable.start_connected);
                assert!(nic.controller_key.is_none());
                let EthernetBacking::Network { device_name, network } = &nic.backing;
                assert_eq!(device_name, "dmz");
                assert_eq!(network.value, "dvportgroup-9");
            }
            other => panic!("expected vmxnet3, got {other:?}"),
        }

        assert_eq!(
            b.add_nic(&NicParams::new("nope"), &networks()).unwrap_err().kind,
            VctErrorKind::ObjectNotFound
        );
        assert_eq!(
            b.edit_nic(4000, 100, &NicParams::new("dmz"), &networks()).unwrap_err().kind,
            VctErrorKind::KeyLinkageViolation
        );
    }

    #[test]
    fn batch_validation_catches_mixed_builders() {
        let mut first = DeviceSpecBuilder::new();
        let mut second = DeviceSpecBuilder::new();
        let (k, scsi) = first.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let disk = first.add_disk(&NewDisk::new("ds1", 1024, k, 0), &datastores()).unwrap();
        // Same counter start, so the second builder hands out the same key.
        let nic = second.add_nic(&NicParams::new("VM Network"), &networks()).unwrap();
        assert_eq!(nic.key(), k);

        let err = validate_device_batch(&[scsi, disk.clone(), nic], &BTreeSet::new()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::KeyLinkageViolation);

        // A disk whose controller is not in the batch is also caught.
        let err = validate_device_batch(&[disk], &BTreeSet::new()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::KeyLinkageViolation);
    }

    #[test]
    fn batch_validation_accepts_live_controllers() {
        let mut b = DeviceSpecBuilder::with_live_keys([1000]);
        let disk = b.add_disk(&NewDisk::new("ds1", 1024, 1000, 1), &datastores()).unwrap();
        let live: BTreeSet<i32> = [1000].into_iter().collect();
        assert!(validate_device_batch(&[disk], &live).is_ok());
    }

    #[test]
    fn live_slots_are_reserved() {
        let devices = vec![LiveDevice {
            key: 2000,
            type_name: "VirtualDisk".into(),
            controller_key: Some(1000),
            unit_number: Some(0),
        }, LiveDevice {
            key: 1000,
            type_name: "ParaVirtualSCSIController".into(),
            controller_key: Some(100),
            unit_number: Some(3),
        }];
        let mut b = DeviceSpecBuilder::from_live_devices(&devices);
        let err = b.add_disk(&NewDisk::new("ds1", 1024, 1000, 0), &datastores()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::InvalidDeviceConfig);
        assert!(b.add_disk(&NewDisk::new("ds1", 1024, 1000, 1), &datastores()).is_ok());
    }

    #[test]
    fn wire_shape_uses_type_names() {
        let mut b = DeviceSpecBuilder::new();
        let (k, scsi) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let disk = b.add_disk(&NewDisk::new("ds1", 1024, k, 0), &datastores()).unwrap();

        let scsi_json = serde_json::to_value(&scsi).unwrap();
        assert_eq!(scsi_json["operation"], "add");
        assert_eq!(scsi_json["device"]["_typeName"], "ParaVirtualSCSIController");
        assert_eq!(scsi_json["device"]["sharedBus"], "noSharing");

        let disk_json = serde_json::to_value(&disk).unwrap();
        assert_eq!(disk_json["fileOperation"], "create");
        assert_eq!(disk_json["device"]["capacityInKB"], 1024);
        assert_eq!(disk_json["device"]["backing"]["_typeName"], "VirtualDiskFlatVer2BackingInfo");
        assert_eq!(disk_json["device"]["backing"]["diskMode"], "persistent");
    }

    #[test]
    fn datastore_miss_leaves_the_slot_free() {
        let mut b = DeviceSpecBuilder::new();
        let (k, _) = b.scsi_controller(0, SharedBus::NoSharing).unwrap();
        let miss = b.add_disk(&NewDisk::new("ds-typo", 1024, k, 0), &datastores()).unwrap_err();
        assert_eq!(miss.kind, VctErrorKind::ObjectNotFound);

        let disk = b.add_disk(&NewDisk::new("ds1", 1024, k, 0), &datastores()).unwrap();
        assert_eq!(disk.controller_key(), Some(k));
    }

    #[test]
    fn second_default_optical_drive_is_rejected() {
        let mut b = DeviceSpecBuilder::new();
        let first = b.optical_drive(&OpticalDriveOptions::create()).unwrap();
        let err = b.optical_drive(&OpticalDriveOptions::create()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::KeyLinkageViolation);

        let second = b
            .optical_drive(&OpticalDriveOptions::create().with_keys(3003, 201))
            .unwrap();
        assert!(validate_device_batch(&[first.clone(), second], &BTreeSet::new()).is_ok());

        let err = validate_device_batch(&[first.clone(), first], &BTreeSet::new()).unwrap_err();
        assert_eq!(err.kind, VctErrorKind::KeyLinkageViolation);
    }

    #[test]
    fn dhcp_adapter_mapping() {
        let mapping = IpAssignment::Dhcp.with_dns("10.0.0.53").adapter_mapping().unwrap();
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["_typeName"], "CustomizationAdapterMapping");
        assert_eq!(json["adapter"]["_typeName"], "CustomizationIPSettings");
        assert_eq!(json["adapter"]["ip"]["_typeName"], "CustomizationDhcpIpGenerator");
        assert!(json["adapter"].get("gateway").is_none());
        assert!(json["adapter"].get("dnsServerList").is_none());
    }

    #[test]
    fn static_adapter_mapping() {
        let mapping = IpAssignment::static_ip("10.0.1.20", "255.255.255.0", "10.0.1.1")
            .with_domain("lab.local")
            .with_dns("10.0.0.53")
            .with_dns("10.0.0.54")
            .adapter_mapping()
            .unwrap();
        let json = serde_json::to_value(&mapping).unwrap();
        let adapter = &json["adapter"];
        assert_eq!(adapter["ip"]["_typeName"], "CustomizationFixedIp");
        assert_eq!(adapter["ip"]["ipAddress"], "10.0.1.20");
        assert_eq!(adapter["subnetMask"], "255.255.255.0");
        assert_eq!(adapter["gateway"], serde_json::json!(["10.0.1.1"]));
        assert_eq!(adapter["dnsDomain"], "lab.local");
        assert_eq!(adapter["dnsServerList"], serde_json::json!(["10.0.0.53", "10.0.0.54"]));

        let back: AdapterMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn static_assignment_rejects_bad_addresses() {
        let bad_ip = IpAssignment::static_ip("10.0.1.300", "255.255.255.0", "10.0.1.1");
        assert_eq!(bad_ip.adapter_mapping().unwrap_err().kind, VctErrorKind::InvalidDeviceConfig);

        let bad_dns = IpAssignment::static_ip("10.0.1.20", "255.255.255.0", "10.0.1.1").with_dns("dns1");
        assert_eq!(bad_dns.adapter_mapping().unwrap_err().kind, VctErrorKind::InvalidDeviceConfig);
    }
}
