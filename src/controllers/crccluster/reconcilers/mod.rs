use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use tracing::debug;

use crate::resources::crcclusters::CrcCluster;
use crate::{Error, Result};

pub mod bundle;
pub mod cluster_config;
pub mod credentials;
pub mod exposure;
pub mod kubelet;
mod quantity;
pub mod route_helper;
pub mod service;
pub mod stabilization;
pub mod virtual_machine;

pub const MANAGER: &str = "crc-operator";
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=crc-operator";
const SPEC_HASH_ANNOTATION: &str = "crc.developer.openshift.io/spec-hash";

/// Outcome of a step that is waiting on the cluster to converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady {
        reason: &'static str,
        message: String,
        requeue_after: Duration,
    },
}

impl Readiness {
    pub fn not_ready(reason: &'static str, message: impl Into<String>, requeue_secs: u64) -> Self {
        Readiness::NotReady {
            reason,
            message: message.into(),
            requeue_after: Duration::from_secs(requeue_secs),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

// labels on every object created for a CrcCluster; the watches select on managed-by
pub fn mandatory_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        ("app.kubernetes.io/name".into(), "crc".into()),
        ("app.kubernetes.io/instance".into(), cluster_name.into()),
        ("app.kubernetes.io/managed-by".into(), MANAGER.into()),
        ("crcCluster".into(), cluster_name.into()),
    ])
}

/// Metadata shared by all objects owned by a CrcCluster: namespace, labels and the controller reference
pub fn base_metadata(crc: &CrcCluster) -> Result<ObjectMeta> {
    let name = crc.name_any();
    let oref = crc
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    Ok(ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(
            crc.namespace()
                .ok_or(Error::MissingObjectKey(".metadata.namespace"))?,
        ),
        labels: Some(mandatory_labels(&name)),
        owner_references: Some(vec![oref]),
        ..Default::default()
    })
}

pub fn object_meta(base_metadata: &ObjectMeta, name: impl Into<String>) -> ObjectMeta {
    let mut meta = base_metadata.clone();
    meta.name = Some(name.into());
    meta
}

pub(crate) fn cluster_name(base_metadata: &ObjectMeta) -> &str {
    base_metadata.name.as_deref().unwrap_or_default()
}

fn spec_hash<K: Serialize>(obj: &K) -> Result<String> {
    let mut hasher = sha2::Sha256::new();
    hasher.update(serde_json::to_vec(obj)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether every field set in `desired` holds the same value in `observed`.
///
/// Fields only present in `observed` are ignored, so apiserver and admission defaults are not drift.
/// Lists must match in length and element by element.
fn contains(observed: &Value, desired: &Value) -> bool {
    match (observed, desired) {
        (_, Value::Null) => true,
        (Value::Object(observed), Value::Object(desired)) => desired
            .iter()
            .all(|(key, value)| contains(observed.get(key).unwrap_or(&Value::Null), value)),
        (Value::Array(observed), Value::Array(desired)) => {
            observed.len() == desired.len()
                && observed.iter().zip(desired).all(|(o, d)| contains(o, d))
        }
        (observed, desired) => observed == desired,
    }
}

/// Whether the stored object still carries everything `desired` declares, status aside
fn matches_desired<K: Resource + Serialize>(existing: &K, desired: &K, hash: &str) -> Result<bool> {
    if existing.annotations().get(SPEC_HASH_ANNOTATION).map(String::as_str) != Some(hash) {
        return Ok(false);
    }
    let observed = serde_json::to_value(existing)?;
    let mut desired = serde_json::to_value(desired)?;
    if let Some(fields) = desired.as_object_mut() {
        fields.remove("status");
    }
    Ok(contains(&observed, &desired))
}

/// Create the object, or re-apply it when it no longer matches the desired shape.
///
/// The hash of the last applied object is kept in an annotation. An object is left alone only
/// when that hash is current and the stored fields still hold every desired value, so edits made
/// behind the operator's back are reverted while server-side defaults are not.
pub async fn apply_if_changed<K>(api: &Api<K>, mut desired: K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let hash = spec_hash(&desired)?;

    if let Some(existing) = api.get_opt(&name).await? {
        if matches_desired(&existing, &desired, &hash)? {
            return Ok(existing);
        }
        debug!("{} {} drifted from its desired shape", K::kind(&()), name);
    }

    desired
        .annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.into(), hash);
    debug!("Applying {} {}", K::kind(&()), name);
    let params = PatchParams::apply(MANAGER).force();
    Ok(api.patch(&name, &params, &Patch::Apply(&desired)).await?)
}

/// Create the object if it does not exist yet, leaving any existing object untouched.
///
/// Returns the observed object and whether the stored copy carries a different desired shape.
pub async fn create_if_missing<K>(api: &Api<K>, mut desired: K) -> Result<(K, bool)>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let hash = spec_hash(&desired)?;

    if let Some(existing) = api.get_opt(&name).await? {
        let drifted = !matches_desired(&existing, &desired, &hash)?;
        return Ok((existing, drifted));
    }

    desired
        .annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.into(), hash);
    debug!("Creating {} {}", K::kind(&()), name);
    Ok((api.create(&PostParams::default(), &desired).await?, false))
}

/// Whether a kube error is the apiserver reporting `code`
pub fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::crccluster::test_support::{cluster, FakeApiServer};
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn test_base_metadata_requires_uid() {
        let mut crc = cluster("demo", "dev");
        crc.metadata.uid = None;
        assert!(matches!(
            base_metadata(&crc),
            Err(Error::MissingObjectKey(".metadata.uid"))
        ));
    }

    #[test]
    fn test_base_metadata_labels_and_owner() {
        let meta = base_metadata(&cluster("demo", "dev")).unwrap();
        let labels = meta.labels.unwrap();
        assert_eq!(labels["app.kubernetes.io/managed-by"], "crc-operator");
        assert_eq!(labels["crcCluster"], "demo");
        let owner = &meta.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "CrcCluster");
        assert_eq!(owner.controller, Some(true));
    }

    #[tokio::test]
    async fn test_apply_if_changed_skips_unchanged_objects() {
        let server = FakeApiServer::new();
        let api: Api<ConfigMap> = Api::namespaced(server.client(), "dev");
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("dev".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("a".into(), "1".into())])),
            ..Default::default()
        };

        apply_if_changed(&api, desired.clone()).await.unwrap();
        apply_if_changed(&api, desired.clone()).await.unwrap();
        assert_eq!(server.writes().len(), 1);

        let mut changed = desired;
        changed.data = Some(BTreeMap::from([("a".into(), "2".into())]));
        apply_if_changed(&api, changed).await.unwrap();
        assert_eq!(server.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_if_changed_reverts_edits_but_keeps_defaults() {
        let server = FakeApiServer::new();
        let api: Api<ConfigMap> = Api::namespaced(server.client(), "dev");
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("dev".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("a".into(), "1".into())])),
            ..Default::default()
        };
        apply_if_changed(&api, desired.clone()).await.unwrap();

        let path = "/api/v1/namespaces/dev/configmaps/settings";
        let mut stored = server.object(path).unwrap();
        stored["data"]["extra"] = serde_json::json!("defaulted");
        server.seed(path, stored.clone());
        apply_if_changed(&api, desired.clone()).await.unwrap();
        assert_eq!(server.writes().len(), 1);

        stored["data"]["a"] = serde_json::json!("edited");
        server.seed(path, stored);
        let restored = apply_if_changed(&api, desired).await.unwrap();
        assert_eq!(server.writes().len(), 2);
        assert_eq!(restored.data.unwrap()["a"], "1");
    }

    #[test]
    fn test_contains_ignores_extra_fields_only() {
        use serde_json::json;
        let desired = json!({"spec": {"ports": [{"port": 80}], "type": "ClusterIP", "ip": null}});
        assert!(contains(
            &json!({"spec": {"ports": [{"port": 80, "protocol": "TCP"}], "type": "ClusterIP"}}),
            &desired
        ));
        assert!(!contains(
            &json!({"spec": {"ports": [{"port": 80}, {"port": 81}], "type": "ClusterIP"}}),
            &desired
        ));
        assert!(!contains(&json!({"spec": {"ports": [{"port": 80}]}}), &desired));
    }
}
