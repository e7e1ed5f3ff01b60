//! Configuration of the OpenShift cluster running inside the VM.
//!
//! Every step reads the live value first and only writes when it differs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::resources::crcclusters::{CrcClusterSpec, CrcClusterStatus};
use crate::resources::openshift::{
    ClusterIngress, ClusterVersion, IngressController, IngressControllerSpec, Route,
};
use crate::ssh::RemoteShell;
use crate::Result;

use super::credentials::{self, ADMIN_USER};
use super::exposure::route_host_for_domain;
use super::is_status;

const OPENSHIFT_CONFIG: &str = "openshift-config";
const INGRESS_OPERATOR_NAMESPACE: &str = "openshift-ingress-operator";
const DEFAULT_INGRESS_CONTROLLER: &str = "default";
const ROUTER_NAMESPACE: &str = "openshift-ingress";
const ROUTER_REPLICAS: i32 = 1;

/// Namespaces whose Routes are created by the cluster itself and carry the bundle's domain
pub const DEFAULT_ROUTE_NAMESPACES: [&str; 3] = [
    "openshift-console",
    "openshift-image-registry",
    "openshift-monitoring",
];

fn secret_bytes(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret.data.as_ref()?.get(key).map(|value| value.0.clone())
}

async fn patch_secret_key(api: &Api<Secret>, name: &str, key: &str, value: &[u8]) -> Result<()> {
    let patch = json!({"data": {key: STANDARD.encode(value)}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn htpasswd_matches(htpasswd: &[u8], password: &str) -> bool {
    let Ok(htpasswd) = std::str::from_utf8(htpasswd) else {
        return false;
    };
    htpasswd
        .lines()
        .filter_map(|line| line.strip_prefix(&format!("{ADMIN_USER}:")))
        .any(|hash| bcrypt::verify(password, hash).unwrap_or(false))
}

fn htpasswd_entry(password: &str) -> Result<Vec<u8>> {
    let hash = bcrypt::hash_with_result(password, bcrypt::DEFAULT_COST)?
        .format_for_version(bcrypt::Version::TwoY);
    Ok(format!("{ADMIN_USER}:{hash}\n").into_bytes())
}

/// Let kubeadmin log in with the generated password and make it a cluster admin
pub async fn update_admin_user(remote: &Client, password: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(remote.clone(), OPENSHIFT_CONFIG);
    let htpass = secrets.get("htpass-secret").await?;
    let current = secret_bytes(&htpass, "htpasswd").unwrap_or_default();
    if !htpasswd_matches(&current, password) {
        info!("Updating kubeadmin password");
        patch_secret_key(&secrets, "htpass-secret", "htpasswd", &htpasswd_entry(password)?).await?;
    }

    let bindings: Api<ClusterRoleBinding> = Api::all(remote.clone());
    if bindings.get_opt("crc-cluster-admin").await?.is_none() {
        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("crc-cluster-admin".into()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: "cluster-admin".into(),
            },
            subjects: Some(vec![Subject {
                api_group: Some("rbac.authorization.k8s.io".into()),
                kind: "User".into(),
                name: ADMIN_USER.into(),
                namespace: None,
            }]),
        };
        bindings.create(&PostParams::default(), &binding).await?;
    }
    Ok(())
}

fn node_pull_secret_script(pull_secret_b64: &str) -> String {
    format!(
        r#"set -e
if ! echo "{pull_secret_b64}" | base64 -d | sudo cmp -s - /var/lib/kubelet/config.json; then
  echo "{pull_secret_b64}" | base64 -d | sudo tee /var/lib/kubelet/config.json >/dev/null
  sudo chmod 0600 /var/lib/kubelet/config.json
fi
"#
    )
}

/// Install the user's pull secret on the node and in the cluster-wide pull secret
pub async fn update_pull_secret(remote: &Client, shell: &dyn RemoteShell, pull_secret_b64: &str) -> Result<()> {
    let pull_secret_b64 = pull_secret_b64.trim();
    shell.output(&node_pull_secret_script(pull_secret_b64)).await?;

    let desired = STANDARD.decode(pull_secret_b64)?;
    let secrets: Api<Secret> = Api::namespaced(remote.clone(), OPENSHIFT_CONFIG);
    let current = secrets.get("pull-secret").await?;
    if secret_bytes(&current, ".dockerconfigjson").as_deref() != Some(desired.as_slice()) {
        info!("Updating cluster pull secret");
        patch_secret_key(&secrets, "pull-secret", ".dockerconfigjson", &desired).await?;
    }
    Ok(())
}

pub async fn update_cluster_id(remote: &Client, cluster_id: &str) -> Result<()> {
    let versions: Api<ClusterVersion> = Api::all(remote.clone());
    let version = versions.get("version").await?;
    if version.spec.cluster_id.as_deref() != Some(cluster_id) {
        let patch = json!({"spec": {"clusterID": cluster_id}});
        versions
            .patch("version", &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// The bundle ships one kubeadmin password for every cluster; it must go
pub async fn remove_shared_kubeadmin_secret(remote: &Client) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(remote.clone(), "kube-system");
    match secrets.delete("kubeadmin", &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_status(&e, 404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn update_ingress_domain(remote: &Client, base_domain: &str) -> Result<()> {
    let ingresses: Api<ClusterIngress> = Api::all(remote.clone());
    let ingress = ingresses.get("cluster").await?;
    if ingress.spec.domain != base_domain {
        let patch = json!({"spec": {"domain": base_domain}});
        ingresses
            .patch("cluster", &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

/// First half of the one-time configuration of a freshly booted cluster: kubeadmin access,
/// pull secret and cluster ID.
///
/// Records the kubeadmin kubeconfig in `status` once the client certificate is issued and
/// returns whether it did, so the caller can persist it before going on.
pub async fn configure_access(
    remote: &Client,
    shell: &dyn RemoteShell,
    spec: &CrcClusterSpec,
    status: &mut CrcClusterStatus,
) -> Result<bool> {
    info!("Updating cluster admin password");
    update_admin_user(remote, &status.kube_admin_password).await?;

    info!("Updating pull secret");
    update_pull_secret(remote, shell, &spec.pull_secret).await?;

    info!("Updating cluster ID");
    update_cluster_id(remote, &status.cluster_id).await?;

    info!("Updating cluster admin client certificate");
    credentials::ensure_admin_kubeconfig(remote, status).await
}

/// Second half of the one-time configuration, run once the kubeconfig is safely recorded
pub async fn configure_cluster(remote: &Client, status: &CrcClusterStatus) -> Result<()> {
    info!("Removing shared kubeadmin secret");
    remove_shared_kubeadmin_secret(remote).await?;

    let approved = credentials::approve_pending(remote).await?;
    info!("Approved {approved} pending CertificateSigningRequests");

    info!("Updating ingress domain");
    update_ingress_domain(remote, &status.base_domain).await
}

/// Keep the default IngressController serving `base_domain` with a single router.
///
/// A controller with the wrong domain is recreated, since the domain cannot be changed in place.
pub async fn align_ingress_controller(remote: &Client, base_domain: &str) -> Result<()> {
    let controllers: Api<IngressController> = Api::namespaced(remote.clone(), INGRESS_OPERATOR_NAMESPACE);
    let recreate = match controllers.get_opt(DEFAULT_INGRESS_CONTROLLER).await? {
        None => true,
        Some(controller) => {
            let observed_domain = controller.status.as_ref().and_then(|s| s.domain.as_deref());
            if observed_domain != Some(base_domain) {
                info!("Recreating IngressController serving {observed_domain:?}");
                match controllers
                    .delete(DEFAULT_INGRESS_CONTROLLER, &DeleteParams::default())
                    .await
                {
                    Ok(_) => {}
                    Err(e) if is_status(&e, 404) => {}
                    Err(e) => return Err(e.into()),
                }
                true
            } else {
                if controller.spec.replicas != Some(ROUTER_REPLICAS) {
                    let patch = json!({"spec": {"replicas": ROUTER_REPLICAS}});
                    controllers
                        .patch(DEFAULT_INGRESS_CONTROLLER, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                }
                false
            }
        }
    };

    if recreate {
        let controller = IngressController {
            metadata: ObjectMeta {
                name: Some(DEFAULT_INGRESS_CONTROLLER.into()),
                namespace: Some(INGRESS_OPERATOR_NAMESPACE.into()),
                ..Default::default()
            },
            spec: IngressControllerSpec {
                domain: Some(base_domain.into()),
                replicas: Some(ROUTER_REPLICAS),
            },
            status: None,
        };
        match controllers.create(&PostParams::default(), &controller).await {
            Ok(_) => {}
            // the ingress operator was quicker
            Err(e) if is_status(&e, 409) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Force-delete router pods stuck terminating, so replacements for the new domain start sooner
pub async fn delete_terminating_router_pods(remote: &Client) -> Result<usize> {
    let pods: Api<Pod> = Api::namespaced(remote.clone(), ROUTER_NAMESPACE);
    let running = pods
        .list(&ListParams::default().fields("status.phase=Running"))
        .await?;
    let mut deleted = 0;
    for pod in running.items.iter().filter(|pod| pod.metadata.deletion_timestamp.is_some()) {
        debug!("Force deleting terminating router pod {}", pod.name_any());
        match pods.delete(&pod.name_any(), &DeleteParams::default().grace_period(0)).await {
            Ok(_) => deleted += 1,
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

/// Point the cluster's own Routes at `base_domain`; returns whether any Route had to change.
pub async fn update_default_routes(remote: &Client, base_domain: &str) -> Result<bool> {
    let mut updated = false;
    for namespace in DEFAULT_ROUTE_NAMESPACES {
        let routes: Api<Route> = Api::namespaced(remote.clone(), namespace);
        for route in routes.list(&ListParams::default()).await? {
            let name = route.name_any();
            let expected = route_host_for_domain(&name, namespace, base_domain);
            if route.spec.host.as_deref() != Some(expected.as_str()) {
                info!("Updating route {namespace}/{name} to {expected}");
                let patch = json!({"spec": {"host": expected}});
                routes
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                updated = true;
            }
        }
    }
    Ok(updated)
}
