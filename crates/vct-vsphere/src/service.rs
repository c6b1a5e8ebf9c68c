//! Aggregate service façade.
//!
//! `VctService` owns the connected session and exposes every lifecycle
//! operation by name. Embedding applications hold
//! `VctServiceState = Arc<Mutex<VctService>>`.

use crate::config::{Placement, VmConfigSpec, VmConfigurator};
use crate::devices::DeviceSpecBuilder;
use crate::error::{VctError, VctResult};
use crate::inventory::{self, CapacityRow, InventoryIndex, NodeAttr};
use crate::remote::RemoteSession;
use crate::task::{DefaultChoiceResolver, MonitorOptions, QuestionResolver, TaskReport};
use crate::types::{ManagedObjectRef, PowerAction, VimConfig, VimConfigSafe};
use crate::vim::VimClient;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Thread-safe handle shared by embedding applications.
pub type VctServiceState = Arc<Mutex<VctService>>;

/// Top-level service over one remote session.
pub struct VctService<S = VimClient> {
    session: Option<S>,
    config: Option<VimConfig>,
    resolver: Arc<dyn QuestionResolver>,
    options: MonitorOptions,
}

impl<S> Default for VctService<S> {
    fn default() -> Self {
        Self {
            session: None,
            config: None,
            resolver: Arc::new(DefaultChoiceResolver),
            options: MonitorOptions::default(),
        }
    }
}

impl VctService<VimClient> {
    /// Create a new (disconnected) service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a vCenter / ESXi host. Returns the session id.
    pub async fn connect(&mut self, config: VimConfig) -> VctResult<String> {
        let mut client = VimClient::new(&config)?;
        let session = client.login().await?;
        self.options = MonitorOptions {
            cancel: self.options.cancel.take(),
            ..MonitorOptions::from_config(&config)
        };
        self.config = Some(config);
        self.session = Some(client);
        Ok(session)
    }

    /// Log out and drop the session.
    pub async fn disconnect(&mut self) -> VctResult<()> {
        if let Some(ref mut client) = self.session {
            let _ = client.logout().await;
        }
        self.session = None;
        self.config = None;
        Ok(())
    }
}

impl<S: RemoteSession> VctService<S> {
    /// Service over an already-established session.
    pub fn with_session(session: S) -> Self {
        Self { session: Some(session), ..Self::default() }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn QuestionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_monitor_options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&S> {
        self.session.as_ref()
    }

    /// Current config (without password).
    pub fn get_config(&self) -> Option<VimConfigSafe> {
        self.config.as_ref().map(|c| VimConfigSafe {
            host: c.host.clone(),
            port: c.port,
            username: c.username.clone(),
            insecure: c.insecure,
        })
    }

    fn require_session(&self) -> VctResult<&S> {
        self.session
            .as_ref()
            .ok_or_else(|| VctError::connection("Not connected to vSphere. Call connect first."))
    }

    fn index(&self) -> VctResult<InventoryIndex<'_>> {
        Ok(InventoryIndex::new(self.require_session()?))
    }

    fn configurator(&self) -> VctResult<VmConfigurator<'_>> {
        Ok(VmConfigurator::new(
            self.require_session()?,
            self.resolver.as_ref(),
            self.options.clone(),
        ))
    }

    // ── Inventory ───────────────────────────────────────────────────

    pub async fn datacenter_names(&self) -> VctResult<Vec<String>> {
        let view = self.index()?.datacenters().await?;
        Ok(inventory::list_attribute(&view, NodeAttr::Name))
    }

    pub async fn cluster_names(&self) -> VctResult<Vec<String>> {
        let view = self.index()?.clusters().await?;
        Ok(inventory::list_attribute(&view, NodeAttr::Name))
    }

    pub async fn list_vm_folders(&self, datacenter: &str) -> VctResult<Vec<String>> {
        let view = self.index()?.datacenters().await?;
        inventory::list_vm_folders(&view, datacenter)
    }

    pub async fn list_vms(&self, datacenter: &str) -> VctResult<BTreeMap<String, String>> {
        let view = self.index()?.datacenters().await?;
        inventory::list_vms(&view, datacenter)
    }

    pub async fn vm_id_by_name(&self, datacenter: &str, name: &str) -> VctResult<Option<String>> {
        let view = self.index()?.datacenters().await?;
        inventory::vm_id_by_name(&view, datacenter, name)
    }

    pub async fn datastore_capacity(&self, cluster: &str, include_header: bool) -> VctResult<Vec<CapacityRow>> {
        let view = self.index()?.clusters().await?;
        inventory::datastore_capacity(&view, cluster, include_header)
    }

    pub async fn datastore_most_free(&self, cluster: &str) -> VctResult<Option<String>> {
        let view = self.index()?.clusters().await?;
        inventory::datastore_most_free(&view, cluster)
    }

    pub async fn cluster_datastores(&self, cluster: &str) -> VctResult<Vec<String>> {
        let view = self.index()?.clusters().await?;
        inventory::cluster_datastores(&view, cluster)
    }

    pub async fn cluster_networks(&self, cluster: &str) -> VctResult<Vec<String>> {
        let view = self.index()?.clusters().await?;
        inventory::cluster_networks(&view, cluster)
    }

    // ── VM lifecycle ────────────────────────────────────────────────

    pub async fn placement(&self, datacenter: &str, cluster: &str, folder: Option<&str>) -> VctResult<Placement> {
        self.configurator()?.placement(datacenter, cluster, folder).await
    }

    pub async fn find_vm(&self, datacenter: &str, name: &str) -> VctResult<ManagedObjectRef> {
        self.configurator()?.find_vm(datacenter, name).await
    }

    pub async fn create_vm(
        &self,
        placement: &Placement,
        datastore: &str,
        spec: VmConfigSpec,
    ) -> VctResult<TaskReport> {
        self.configurator()?
            .create(&placement.folder, datastore, &placement.pool, spec)
            .await
    }

    pub async fn device_builder(&self, vm: &ManagedObjectRef) -> VctResult<DeviceSpecBuilder> {
        self.configurator()?.device_builder(vm).await
    }

    pub async fn reconfig_vm(&self, vm: &ManagedObjectRef, spec: VmConfigSpec) -> VctResult<TaskReport> {
        self.configurator()?.reconfig(vm, spec).await
    }

    pub async fn power_vm(&self, vm: &ManagedObjectRef, action: PowerAction) -> VctResult<TaskReport> {
        self.configurator()?.power(vm, action).await
    }

    pub async fn mount_iso(
        &self,
        vm: &ManagedObjectRef,
        datastore: &str,
        iso_path: &str,
        iso_name: &str,
    ) -> VctResult<TaskReport> {
        self.configurator()?.mount_iso(vm, datastore, iso_path, iso_name).await
    }

    pub async fn unmount_iso(&self, vm: &ManagedObjectRef) -> VctResult<TaskReport> {
        self.configurator()?.unmount_iso(vm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VctErrorKind;
    use crate::task::FixedChoiceResolver;
    use crate::testing::{cluster, datacenter, datastore, folder, question, vm, FakeSession};
    use crate::types::TaskSnapshot;
    use std::time::Duration;

    fn service(session: FakeSession) -> VctService<FakeSession> {
        VctService::with_session(session)
            .with_monitor_options(MonitorOptions::default().with_poll_interval(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn disconnected_service_refuses_work() {
        let svc = VctService::new();
        assert!(!svc.is_connected());
        assert!(svc.get_config().is_none());
        let err = svc.datacenter_names().await.unwrap_err();
        assert_eq!(err.kind, VctErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn inventory_by_name() {
        let svc = service(FakeSession::new().with_inventory_nodes(vec![
            datacenter("DC1", folder("vm").with_child(folder("Prod")).with_child(vm("jump01", "vm-100"))),
            cluster("Cluster-A", vec![datastore("ds1", "VMFS", 100, 40, None)], vec![]),
        ]));
        assert_eq!(svc.datacenter_names().await.unwrap(), vec!["DC1"]);
        assert_eq!(svc.cluster_names().await.unwrap(), vec!["Cluster-A"]);
        assert_eq!(svc.list_vm_folders("DC1").await.unwrap(), vec!["Prod"]);
        assert_eq!(svc.vm_id_by_name("DC1", "jump01").await.unwrap().as_deref(), Some("vm-100"));
        assert_eq!(svc.datastore_capacity("Cluster-A", true).await.unwrap().len(), 2);
        assert_eq!(svc.datastore_most_free("Cluster-A").await.unwrap().as_deref(), Some("ds1"));
        assert_eq!(svc.cluster_datastores("Cluster-A").await.unwrap(), vec!["ds1"]);
    }

    #[tokio::test]
    async fn injected_resolver_answers_questions() {
        let session = FakeSession::new().with_snapshots(vec![
            TaskSnapshot::running(None).with_question(question("q-1", &[(0, "Retry"), (1, "Cancel")])),
            TaskSnapshot::success(),
        ]);
        let svc = service(session).with_resolver(Arc::new(FixedChoiceResolver(1)));
        let target = ManagedObjectRef::new("VirtualMachine", "vm-7");
        let report = svc.power_vm(&target, PowerAction::Reset).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.questions_answered, 1);
    }
}
