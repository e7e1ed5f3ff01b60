use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::resources::openshift::Infrastructure;
use crate::Result;

use super::{is_status, Readiness};

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn reports_not_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status != "True")
        })
}

/// Whether the control plane is far enough along for configuration changes to stick
pub async fn control_plane_readiness(remote: &Client) -> Result<Readiness> {
    let config_maps: Api<ConfigMap> = Api::namespaced(remote.clone(), "kube-system");
    let has_client_ca = config_maps
        .get_opt("extension-apiserver-authentication")
        .await?
        .and_then(|cm| cm.data)
        .and_then(|data| data.get("requestheader-client-ca-file").cloned())
        .is_some_and(|ca| !ca.is_empty());
    if !has_client_ca {
        return Ok(Readiness::not_ready(
            "ControlPlaneNotReady",
            "No requestheader-client-ca yet",
            10,
        ));
    }

    let pods: Api<Pod> = Api::namespaced(remote.clone(), "openshift-apiserver");
    let apiserver_pods = pods.list(&ListParams::default()).await?;
    if !apiserver_pods.items.iter().any(pod_ready) {
        return Ok(Readiness::not_ready(
            "ControlPlaneNotReady",
            format!(
                "None of {} OpenShift API server pods is ready",
                apiserver_pods.items.len()
            ),
            10,
        ));
    }
    Ok(Readiness::Ready)
}

/// Make the cluster advertise its external API address
pub async fn update_api_server_url(remote: &Client, api_url: &str) -> Result<()> {
    let desired = format!("{api_url}:443");
    let infrastructures: Api<Infrastructure> = Api::all(remote.clone());
    let infrastructure = infrastructures.get("cluster").await?;
    let current = infrastructure
        .status
        .as_ref()
        .and_then(|status| status.api_server_url.as_deref());
    if current == Some(desired.as_str()) {
        return Ok(());
    }

    debug!("Setting Infrastructure apiServerURL to {desired}");
    let patch = json!({"status": {"apiServerURL": desired}});
    let params = PatchParams::default();
    match infrastructures
        .patch_status("cluster", &params, &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        // older releases serve Infrastructure without a status subresource
        Err(e) if is_status(&e, 404) => {
            infrastructures
                .patch("cluster", &params, &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn is_platform_namespace(namespace: &str) -> bool {
    namespace.starts_with("openshift-") || namespace.starts_with("kube-")
}

fn is_ignored(pod: &Pod) -> bool {
    let name = pod.name_any();
    pod.namespace().as_deref() == Some("openshift-marketplace")
        && (name.starts_with("community-operators-") || name.starts_with("certified-operators-"))
}

/// `namespace/name` of every platform pod that reports itself not ready
pub async fn not_ready_pods(remote: &Client) -> Result<Vec<String>> {
    let pods: Api<Pod> = Api::all(remote.clone());
    let pods = pods
        .list(&ListParams::default().fields("status.phase!=Succeeded"))
        .await?;
    Ok(pods
        .items
        .iter()
        .filter(|pod| pod.namespace().as_deref().is_some_and(is_platform_namespace))
        .filter(|pod| !is_ignored(pod))
        .filter(|pod| reports_not_ready(pod))
        .map(|pod| format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()))
        .collect())
}

/// GET the console, returning the status code; transport errors count as no answer.
pub async fn probe_console(http: &reqwest::Client, console_url: &str) -> Option<StatusCode> {
    match http.get(console_url).send().await {
        Ok(response) => Some(response.status()),
        Err(e) => {
            debug!("Console at {console_url} is unreachable: {e}");
            None
        }
    }
}

pub fn console_readiness(status: Option<StatusCode>) -> Readiness {
    match status {
        Some(code) if code.is_success() => Readiness::Ready,
        Some(code) => Readiness::not_ready("ConsoleNotReady", format!("Console answered {code}"), 10),
        None => Readiness::not_ready("ConsoleNotReady", "Console is unreachable", 10),
    }
}
