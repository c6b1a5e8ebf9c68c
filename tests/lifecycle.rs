use std::sync::Arc;
use std::time::Duration;

use vctools::vsphere::config::VmConfigSpec;
use vctools::vsphere::devices::{
    CdromBacking, DeviceOperation, DeviceSpec, NewDisk, NicParams, OpticalDriveOptions, SharedBus,
    VirtualDevice,
};
use vctools::vsphere::error::VctErrorKind;
use vctools::vsphere::service::VctService;
use vctools::vsphere::task::{FixedChoiceResolver, MonitorOptions, TaskOutcome};
use vctools::vsphere::testing::{
    cluster, datacenter, datastore, folder, live_device, network, question, vm, FakeSession,
    Submission,
};
use vctools::vsphere::types::{PowerAction, TaskSnapshot};

fn lab() -> FakeSession {
    FakeSession::new().with_inventory_nodes(vec![
        datacenter(
            "DC1",
            folder("vm")
                .with_child(folder("Prod").with_child(folder("Web")).with_child(vm("web01", "vm-101")))
                .with_child(vm("jump01", "vm-100")),
        ),
        cluster(
            "Cluster-A",
            vec![
                datastore("ds-fast", "VMFS", 4 << 40, 3 << 40, Some(1 << 40)),
                datastore("ds-slow", "VMFS", 8 << 40, 1 << 40, None),
                datastore("isos", "NFS", 1 << 40, 1 << 39, None),
            ],
            vec![network("VM Network", "network-5"), network("dmz", "dvportgroup-9")],
        ),
    ])
}

fn fast() -> MonitorOptions {
    MonitorOptions::default().with_poll_interval(Duration::from_millis(1))
}

#[tokio::test]
async fn create_vm_end_to_end() {
    let session = lab().with_snapshots(vec![
        TaskSnapshot::running(Some(10)),
        TaskSnapshot::running(Some(70)),
        TaskSnapshot::success(),
    ]);
    let svc = VctService::with_session(session).with_monitor_options(fast());

    let ds = svc.datastore_most_free("Cluster-A").await.unwrap().unwrap();
    assert_eq!(ds, "ds-fast");

    let placement = svc.placement("DC1", "Cluster-A", Some("Prod -> Web")).await.unwrap();
    let mut builder = vctools::vsphere::devices::DeviceSpecBuilder::new();
    let (ctrl, scsi) = builder.scsi_controller(0, SharedBus::NoSharing).unwrap();
    let disk = builder
        .add_disk(&NewDisk::new(&ds, 40 * 1024 * 1024, ctrl, 0), &placement.datastores)
        .unwrap();
    let nic = builder.add_nic(&NicParams::new("dmz"), &placement.networks).unwrap();
    let cdrom = builder.optical_drive(&OpticalDriveOptions::create()).unwrap();

    let spec = VmConfigSpec::new("web02")
        .with_cpus(2)
        .with_memory_mb(4096)
        .with_guest_id("rhel7_64Guest")
        .with_annotation("built by vctools")
        .with_devices([scsi, disk, nic, cdrom]);
    let report = svc.create_vm(&placement, &ds, spec).await.unwrap();

    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.progress_updates, vec![10, 70]);
    assert_eq!(report.to_string(), "[success] | task successfully completed.");
}

#[tokio::test]
async fn reconfig_with_question_and_retry_answer() {
    let session = lab()
        .with_live_devices(vec![
            live_device(1000, "ParaVirtualSCSIController", Some(100), Some(3)),
            live_device(2000, "VirtualDisk", Some(1000), Some(0)),
            live_device(3002, "VirtualCdrom", Some(201), Some(0)),
        ])
        .with_snapshots(vec![
            TaskSnapshot::running(Some(50)),
            TaskSnapshot::running(Some(50)).with_question(question("q-1", &[(0, "Retry"), (1, "Cancel")])),
            TaskSnapshot::success(),
        ]);
    let svc = VctService::with_session(session)
        .with_monitor_options(fast())
        .with_resolver(Arc::new(FixedChoiceResolver(0)));

    let vm_ref = svc.find_vm("DC1", "web01").await.unwrap();
    let placement = svc.placement("DC1", "Cluster-A", None).await.unwrap();
    let mut builder = svc.device_builder(&vm_ref).await.unwrap();
    let disk = builder
        .add_disk(&NewDisk::new("ds-slow", 1024 * 1024, 1000, 1), &placement.datastores)
        .unwrap();

    let report = svc
        .reconfig_vm(&vm_ref, VmConfigSpec::default().with_cpus(4).with_device(disk))
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.progress_updates, vec![50]);
    assert_eq!(report.questions_answered, 1);
}

#[tokio::test]
async fn failed_task_is_a_report_not_an_error() {
    let session = lab().with_snapshots(vec![
        TaskSnapshot::running(Some(5)),
        TaskSnapshot::error("The operation is not allowed in the current state."),
    ]);
    let svc = VctService::with_session(session).with_monitor_options(fast());
    let vm_ref = svc.find_vm("DC1", "jump01").await.unwrap();

    let report = svc.power_vm(&vm_ref, PowerAction::Off).await.unwrap();
    assert_eq!(
        report.to_string(),
        "[error] | The operation is not allowed in the current state."
    );
}

#[tokio::test]
async fn guest_reboot_needs_no_task() {
    let svc = VctService::with_session(lab()).with_monitor_options(fast());
    let vm_ref = svc.find_vm("DC1", "jump01").await.unwrap();
    let report = svc.power_vm(&vm_ref, PowerAction::Reboot).await.unwrap();
    assert!(report.is_success());
    assert!(report.task.is_none());
}

#[tokio::test]
async fn capacity_report_rows() {
    let svc = VctService::with_session(lab());
    let rows = svc.datastore_capacity("Cluster-A", true).await.unwrap();
    let cells: Vec<[String; 6]> = rows.iter().map(|r| r.cells()).collect();

    assert_eq!(cells.len(), 3);
    assert_eq!(cells[0][0], "Datastore");
    assert_eq!(cells[1][0], "ds-fast");
    assert_eq!(cells[1][1], "4.00 TB");
    assert_eq!(cells[1][2], "2.00 TB");
    assert_eq!(cells[1][3], "50.00%");
    assert_eq!(cells[1][5], "75.00%");
    assert_eq!(cells[2][0], "ds-slow");

    let err = svc.datastore_capacity("Cluster-B", true).await.unwrap_err();
    assert_eq!(err.kind, VctErrorKind::ClusterNotFound);
}

#[tokio::test]
async fn folders_and_vms() {
    let svc = VctService::with_session(lab());
    assert_eq!(svc.list_vm_folders("DC1").await.unwrap(), vec!["Prod", "Prod -> Web"]);
    let vms = svc.list_vms("DC1").await.unwrap();
    assert_eq!(vms.keys().collect::<Vec<_>>(), vec!["jump01", "web01"]);
}

#[tokio::test]
async fn mount_then_unmount_iso() {
    let session = lab().with_live_devices(vec![live_device(3002, "VirtualCdrom", Some(201), Some(0))]);
    let svc = VctService::with_session(session).with_monitor_options(fast());
    let vm_ref = svc.find_vm("DC1", "web01").await.unwrap();

    assert!(svc.mount_iso(&vm_ref, "isos", "linux/rhel", "rhel7.iso").await.unwrap().is_success());
    assert!(svc.unmount_iso(&vm_ref).await.unwrap().is_success());

    let changes: Vec<DeviceSpec> = svc
        .session()
        .unwrap()
        .submissions()
        .into_iter()
        .map(|s| match s {
            Submission::Reconfigure { vm, mut spec } => {
                assert_eq!(vm, vm_ref);
                assert_eq!(spec.device_change.len(), 1);
                spec.device_change.remove(0)
            }
            other => panic!("expected reconfigure, got {other:?}"),
        })
        .collect();
    assert_eq!(changes.len(), 2);

    let mounted = &changes[0];
    assert_eq!(mounted.operation, DeviceOperation::Edit);
    assert_eq!(mounted.key(), 3002);
    assert_eq!(mounted.backing_file_name(), Some("[isos] linux/rhel/rhel7.iso"));

    let unmounted = &changes[1];
    assert_eq!(unmounted.operation, DeviceOperation::Edit);
    assert!(unmounted.backing_file_name().is_none());
    match &unmounted.device {
        VirtualDevice::Cdrom(cd) => {
            assert!(matches!(cd.backing, CdromBacking::RemotePassthrough { exclusive: false, .. }));
            assert_eq!(cd.controller_key, 201);
        }
        other => panic!("expected optical drive, got {other:?}"),
    }
}

#[tokio::test]
async fn submission_failure_propagates() {
    let session = lab().failing_submissions(vctools::vsphere::error::VctError::auth("Session expired"));
    let svc = VctService::with_session(session).with_monitor_options(fast());
    let vm_ref = svc.find_vm("DC1", "web01").await.unwrap();
    let err = svc.power_vm(&vm_ref, PowerAction::On).await.unwrap_err();
    assert_eq!(err.kind, VctErrorKind::AuthenticationError);
}

#[test]
fn guest_shutdown_outside_a_runtime() {
    let session = lab();
    let vm_ref = vctools::vsphere::types::ManagedObjectRef::new("VirtualMachine", "vm-100");
    let svc = VctService::with_session(session);
    let report = tokio_test::block_on(svc.power_vm(&vm_ref, PowerAction::Shutdown)).unwrap();
    assert!(report.is_success());
}
