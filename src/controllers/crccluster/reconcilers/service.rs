use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Api, Client};

use crate::ssh::SSH_PORT;
use crate::Result;

use super::virtual_machine::VM_NAME_LABEL;
use super::{apply_if_changed, cluster_name, object_meta};

pub const API_PORT: i32 = 6443;

fn port(name: &str, port: i32, target_port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        protocol: Some("TCP".into()),
        port,
        target_port: Some(IntOrString::Int(target_port)),
        ..Default::default()
    }
}

fn crc_service(base_metadata: &ObjectMeta) -> Service {
    let name = cluster_name(base_metadata);
    Service {
        metadata: object_meta(base_metadata, name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(BTreeMap::from([(VM_NAME_LABEL.into(), name.into())])),
            ports: Some(vec![
                port("ssh", SSH_PORT.into(), 22),
                port("api", API_PORT, API_PORT),
                port("http", 80, 80),
                port("https", 443, 443),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Whether the apiserver has allocated the Service an address
pub fn has_cluster_ip(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty() && ip != "None")
}

pub async fn reconcile_service(client: &Client, base_metadata: &ObjectMeta) -> Result<Service> {
    let namespace = base_metadata.namespace.as_deref().unwrap_or_default();
    let svc_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    apply_if_changed(&svc_api, crc_service(base_metadata)).await
}
