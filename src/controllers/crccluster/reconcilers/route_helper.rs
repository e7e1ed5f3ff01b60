use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Api, Client};
use tracing::warn;

use crate::controllers::OperatorConfig;
use crate::Result;

use super::{apply_if_changed, cluster_name, create_if_missing, object_meta};

const READ: [&str; 3] = ["get", "list", "watch"];
const MANAGE: [&str; 7] = ["create", "delete", "get", "list", "patch", "update", "watch"];

fn helper_name(base_metadata: &ObjectMeta) -> String {
    format!("{}-route-helper", cluster_name(base_metadata))
}

fn helper_labels(base_metadata: &ObjectMeta) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("crcCluster".into(), cluster_name(base_metadata).into()),
        ("app.kubernetes.io/component".into(), "route-helper".into()),
    ])
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.into()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn helper_role(base_metadata: &ObjectMeta) -> Role {
    Role {
        metadata: object_meta(base_metadata, helper_name(base_metadata)),
        rules: Some(vec![
            rule("crc.developer.openshift.io", &["*"], &READ),
            rule("apps", &["deployments"], &READ),
            rule("networking.k8s.io", &["ingresses"], &MANAGE),
            rule("route.openshift.io", &["routes", "routes/custom-host"], &MANAGE),
        ]),
    }
}

fn helper_role_binding(base_metadata: &ObjectMeta) -> RoleBinding {
    let name = helper_name(base_metadata);
    RoleBinding {
        metadata: object_meta(base_metadata, name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name,
            namespace: base_metadata.namespace.clone(),
            ..Default::default()
        }]),
    }
}

fn helper_deployment(base_metadata: &ObjectMeta, image: &str) -> Deployment {
    let name = helper_name(base_metadata);
    let labels = helper_labels(base_metadata);
    let mut metadata = object_meta(base_metadata, name.clone());
    if let Some(existing) = metadata.labels.as_mut() {
        existing.extend(labels.clone());
    }

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name),
                    containers: vec![Container {
                        name: "route-helper".into(),
                        image: Some(image.into()),
                        image_pull_policy: Some("Always".into()),
                        env: Some(vec![
                            EnvVar {
                                name: "CRC_NAME".into(),
                                value: Some(cluster_name(base_metadata).into()),
                                value_from: None,
                            },
                            EnvVar {
                                name: "CRC_NAMESPACE".into(),
                                value: base_metadata.namespace.clone(),
                                value_from: None,
                            },
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Deploy the in-namespace helper that keeps exposure for the cluster's own Routes in sync.
///
/// The Deployment is created once and never updated, since admission defaults make a blind
/// update fight with the apiserver; drift is only logged.
pub async fn reconcile_route_helper(
    client: &Client,
    base_metadata: &ObjectMeta,
    config: &OperatorConfig,
) -> Result<()> {
    let namespace = base_metadata.namespace.as_deref().unwrap_or_default();

    let sa_api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    create_if_missing(
        &sa_api,
        ServiceAccount {
            metadata: object_meta(base_metadata, helper_name(base_metadata)),
            ..Default::default()
        },
    )
    .await?;

    let role_api: Api<Role> = Api::namespaced(client.clone(), namespace);
    apply_if_changed(&role_api, helper_role(base_metadata)).await?;

    let rb_api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    create_if_missing(&rb_api, helper_role_binding(base_metadata)).await?;

    let deploy_api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let (_, drifted) = create_if_missing(
        &deploy_api,
        helper_deployment(base_metadata, &config.routes_helper_image),
    )
    .await?;
    if drifted {
        warn!(
            "Deployment {} differs from its desired spec; leaving it as is",
            helper_name(base_metadata)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::crccluster::reconcilers::base_metadata;
    use crate::controllers::crccluster::test_support::{cluster, operator_config, FakeApiServer};
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[test]
    fn test_role_rules() {
        let role = helper_role(&base_metadata(&cluster("demo", "dev")).unwrap());
        assert_json_include!(
            actual: serde_json::to_value(&role).unwrap(),
            expected: json!({
                "metadata": {"name": "demo-route-helper", "namespace": "dev"},
                "rules": [
                    {"apiGroups": ["crc.developer.openshift.io"], "resources": ["*"], "verbs": ["get", "list", "watch"]},
                    {"apiGroups": ["apps"], "resources": ["deployments"]},
                    {"apiGroups": ["networking.k8s.io"], "resources": ["ingresses"]},
                    {"apiGroups": ["route.openshift.io"], "resources": ["routes", "routes/custom-host"]}
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_route_helper_deployment_is_never_updated() {
        let server = FakeApiServer::new();
        let client = server.client();
        let base = base_metadata(&cluster("demo", "dev")).unwrap();

        reconcile_route_helper(&client, &base, &operator_config())
            .await
            .unwrap();
        let deployment_path = "/apis/apps/v1/namespaces/dev/deployments/demo-route-helper";
        let deployment = server.object(deployment_path).unwrap();
        assert_json_include!(
            actual: deployment,
            expected: json!({
                "spec": {"template": {"spec": {
                    "serviceAccountName": "demo-route-helper",
                    "containers": [{
                        "image": "quay.io/crcont/routes-helper:latest",
                        "imagePullPolicy": "Always",
                        "env": [{"name": "CRC_NAME", "value": "demo"}, {"name": "CRC_NAMESPACE", "value": "dev"}]
                    }]
                }}}
            })
        );

        let mut config = operator_config();
        config.routes_helper_image = "quay.io/crcont/routes-helper:v2".into();
        let writes = server.writes().len();
        reconcile_route_helper(&client, &base, &config).await.unwrap();
        assert_eq!(server.writes().len(), writes);
        assert_eq!(
            server.object(deployment_path).unwrap()["spec"]["template"]["spec"]["containers"][0]["image"],
            "quay.io/crcont/routes-helper:latest"
        );
    }
}
