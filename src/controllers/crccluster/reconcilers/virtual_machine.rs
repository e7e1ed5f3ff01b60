use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client};
use tracing::debug;

use crate::resources::crcclusters::CrcClusterSpec;
use crate::resources::kubevirt::{
    ContainerDiskSource, Cpu, DataVolumeRef, DataVolumeSource, DataVolumeSourceRegistry,
    DataVolumeSpec, DataVolumeTemplateSpec, Devices, Disk, DiskTarget, DomainResources,
    DomainSpec, Interface, InterfaceMasquerade, Machine, Memory, Network, PodNetwork,
    VirtualMachine, VirtualMachineInstanceSpec, VirtualMachineInstanceTemplateSpec,
    VirtualMachineSpec, Volume,
};
use crate::Result;

use super::bundle::ResolvedBundle;
use super::{apply_if_changed, cluster_name, object_meta};

// scheduling request, independent of the guest memory so that clusters can overcommit
const MEMORY_REQUEST: &str = "8Gi";
const MIN_CPU_REQUEST: i32 = 2;
const ROOT_DISK: &str = "rootdisk";
const NIC: &str = "nic0";

/// Label KubeVirt puts on the virt-launcher pod, used as the Service selector
pub const VM_NAME_LABEL: &str = "vm.kubevirt.io/name";

fn cpu_request(cpu: i32) -> i32 {
    (cpu / 2).max(MIN_CPU_REQUEST)
}

fn vm_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("crcCluster".into(), name.into()),
        ("kubevirt.io/domain".into(), name.into()),
        (VM_NAME_LABEL.into(), name.into()),
    ])
}

fn root_volume(name: &str, bundle: &ResolvedBundle) -> (Volume, Vec<DataVolumeTemplateSpec>) {
    match &bundle.persistent_disk_size {
        None => (
            Volume {
                name: ROOT_DISK.into(),
                container_disk: Some(ContainerDiskSource {
                    image: bundle.image.clone(),
                }),
                data_volume: None,
            },
            vec![],
        ),
        Some(size) => {
            let data_volume_name = format!("{name}-datavolume");
            (
                Volume {
                    name: ROOT_DISK.into(),
                    container_disk: None,
                    data_volume: Some(DataVolumeRef {
                        name: data_volume_name.clone(),
                    }),
                },
                vec![DataVolumeTemplateSpec {
                    metadata: ObjectMeta {
                        name: Some(data_volume_name),
                        ..Default::default()
                    },
                    spec: DataVolumeSpec {
                        source: DataVolumeSource {
                            registry: Some(DataVolumeSourceRegistry {
                                url: format!("docker://{}", bundle.image),
                            }),
                        },
                        pvc: Some(PersistentVolumeClaimSpec {
                            access_modes: Some(vec!["ReadWriteOnce".into()]),
                            resources: Some(VolumeResourceRequirements {
                                requests: Some(BTreeMap::from([(
                                    "storage".into(),
                                    Quantity(size.clone()),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                    },
                }],
            )
        }
    }
}

pub fn desired_virtual_machine(
    base_metadata: &ObjectMeta,
    spec: &CrcClusterSpec,
    bundle: &ResolvedBundle,
) -> VirtualMachine {
    let name = cluster_name(base_metadata);
    let (root_volume, data_volume_templates) = root_volume(name, bundle);

    VirtualMachine {
        metadata: object_meta(base_metadata, name),
        spec: VirtualMachineSpec {
            running: Some(!spec.stopped),
            template: VirtualMachineInstanceTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(vm_labels(name)),
                    ..Default::default()
                }),
                spec: VirtualMachineInstanceSpec {
                    domain: DomainSpec {
                        cpu: Some(Cpu {
                            sockets: spec.cpu.max(1) as u32,
                            cores: 1,
                            threads: 1,
                        }),
                        memory: Some(Memory {
                            guest: Some(Quantity(spec.memory.clone())),
                        }),
                        resources: Some(DomainResources {
                            requests: Some(BTreeMap::from([
                                ("cpu".into(), Quantity(cpu_request(spec.cpu).to_string())),
                                ("memory".into(), Quantity(MEMORY_REQUEST.into())),
                            ])),
                            overcommit_guest_overhead: Some(true),
                        }),
                        machine: Some(Machine {
                            r#type: "q35".into(),
                        }),
                        devices: Devices {
                            disks: vec![Disk {
                                name: ROOT_DISK.into(),
                                boot_order: Some(1),
                                disk: Some(DiskTarget {
                                    bus: "virtio".into(),
                                }),
                            }],
                            interfaces: vec![Interface {
                                name: NIC.into(),
                                model: Some("virtio".into()),
                                masquerade: Some(InterfaceMasquerade {}),
                            }],
                            network_interface_multiqueue: Some(true),
                        },
                    },
                    hostname: Some("crc".into()),
                    networks: vec![Network {
                        name: NIC.into(),
                        pod: Some(PodNetwork {}),
                    }],
                    volumes: vec![root_volume],
                },
            },
            data_volume_templates,
        },
        status: None,
    }
}

/// Whether the VM is declared running and KubeVirt reports it ready
pub fn vm_ready(vm: &VirtualMachine) -> bool {
    vm.spec.running == Some(true)
        && vm
            .status
            .as_ref()
            .and_then(|status| status.ready)
            .unwrap_or(false)
}

pub async fn reconcile_virtual_machine(
    client: &Client,
    base_metadata: &ObjectMeta,
    spec: &CrcClusterSpec,
    bundle: &ResolvedBundle,
) -> Result<VirtualMachine> {
    let namespace = base_metadata.namespace.as_deref().unwrap_or_default();
    let vm_api: Api<VirtualMachine> = Api::namespaced(client.clone(), namespace);
    let vm = apply_if_changed(&vm_api, desired_virtual_machine(base_metadata, spec, bundle)).await?;
    debug!(
        "VirtualMachine {} is {}",
        cluster_name(base_metadata),
        vm.status
            .as_ref()
            .and_then(|s| s.printable_status.as_deref())
            .unwrap_or("unknown")
    );
    Ok(vm)
}
