use std::borrow::Cow;

use kube::{CELSchema, CustomResource};
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CPU: i32 = 4;
pub const DEFAULT_MEMORY: &str = "16Gi";

/// Describes a disposable single-node OpenShift cluster running in a KubeVirt VirtualMachine
#[derive(CustomResource, CELSchema, Deserialize, Serialize, Clone, Debug, PartialEq)]
#[kube(
    kind = "CrcCluster",
    group = "crc.developer.openshift.io",
    version = "v1alpha1",
    namespaced,
    schema = "manual",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"API URL", "type":"string", "jsonPath":".status.apiURL"}"#,
    printcolumn = r#"{"name":"Console URL", "priority": 1, "type":"string", "jsonPath":".status.consoleURL"}"#,
    printcolumn = r#"{"name":"Age", "description": "CreationTimestamp is a timestamp representing the server time when this object was created. It is not guaranteed to be set in happens-before order across separate operations. Clients may not set this value. It is represented in RFC3339 form and is in UTC", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "CrcClusterStatus", shortname = "crc")]
#[serde(rename_all = "camelCase")]
pub struct CrcClusterSpec {
    /// Number of virtual CPU sockets given to the VM. Defaults to 4.
    #[serde(default = "default_cpu")]
    #[schemars(range(min = 1))]
    pub cpu: i32,
    /// Guest memory of the VM, as a Kubernetes quantity. Defaults to 16Gi.
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Base64-encoded registry pull secret, as downloaded from cloud.redhat.com
    pub pull_secret: String,
    /// Name of the CrcBundle to boot. Defaults to the operator's default bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,
    /// Container disk image overriding the bundle's image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_image: Option<String>,
    #[serde(default)]
    #[cel_validate(rule = Rule::new("self == oldSelf").message("storage is immutable"))]
    pub storage: CrcStorageSpec,
    /// Stop the VM while keeping all owned objects around
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,
}

fn default_cpu() -> i32 {
    DEFAULT_CPU
}

fn default_memory() -> String {
    DEFAULT_MEMORY.into()
}

impl Default for CrcClusterSpec {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU,
            memory: DEFAULT_MEMORY.into(),
            pull_secret: String::new(),
            bundle_name: None,
            bundle_image: None,
            storage: CrcStorageSpec::default(),
            stopped: false,
        }
    }
}

// Hoisted from the derived implementation so that we can restrict names to DNS labels; they end up in host names
impl schemars::JsonSchema for CrcCluster {
    fn schema_name() -> String {
        "CrcCluster".to_owned()
    }
    fn schema_id() -> Cow<'static, str> {
        "crc_operator::resources::CrcCluster".into()
    }
    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        let mut schema_object = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some(
                    "CrcCluster describes the configuration and status of a CodeReady Containers cluster."
                        .to_owned(),
                ),
                ..Default::default()
            })),
            ..Default::default()
        };
        let object_validation = schema_object.object();

        let mut name = SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            ..Default::default()
        };
        let string_validation = name.string();
        string_validation.min_length = Some(1);
        string_validation.max_length = Some(40);
        string_validation.pattern = Some("^[a-z]([-a-z0-9]*[a-z0-9])?$".into());

        let mut metadata = SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        };
        metadata
            .object()
            .properties
            .insert("name".to_owned(), Schema::Object(name));

        object_validation
            .properties
            .insert("metadata".to_owned(), Schema::Object(metadata));
        object_validation.required.insert("metadata".to_owned());

        object_validation
            .properties
            .insert("spec".to_owned(), gen.subschema_for::<CrcClusterSpec>());
        object_validation.required.insert("spec".to_owned());

        object_validation.properties.insert(
            "status".to_owned(),
            gen.subschema_for::<Option<CrcClusterStatus>>(),
        );
        Schema::Object(schema_object)
    }
}

/// Disk configuration of the VM
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrcStorageSpec {
    /// Import the bundle image into a PersistentVolumeClaim instead of booting it as an ephemeral container disk
    #[serde(default)]
    pub persistent: bool,
    /// Size of the persistent disk. Must not be below the bundle's disk size, which is also the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Status of the CrcCluster.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub struct CrcClusterStatus {
    #[serde(rename = "baseDomain", default, skip_serializing_if = "String::is_empty")]
    pub base_domain: String,
    #[serde(rename = "apiURL", default, skip_serializing_if = "String::is_empty")]
    pub api_url: String,
    #[serde(rename = "consoleURL", default, skip_serializing_if = "String::is_empty")]
    pub console_url: String,
    #[serde(rename = "clusterID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    /// Base64-encoded kubeconfig for the kubeadmin user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    /// Base64-encoded PEM private key backing the kubeadmin client certificate
    #[serde(
        rename = "kubeAdminClientKey",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kube_admin_client_key: String,
    #[serde(
        rename = "kubeAdminPassword",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kube_admin_password: String,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CrcClusterCondition>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, schemars::JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrcClusterCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,

    /// Human-readable message indicating details about last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Unique, one-word, CamelCase reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Status is the status of the condition. Can be True, False, Unknown.
    pub status: String,

    /// Type of the condition, known values are (`VirtualMachineNotReady`, `NetworkingNotReady`, `KubeletNotReady`, `ClusterNotConfigured`, `Ready`).
    pub r#type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_defaults() {
        let spec: CrcClusterSpec = serde_json::from_value(json!({
            "pullSecret": "e30K"
        }))
        .unwrap();
        assert_eq!(spec.cpu, 4);
        assert_eq!(spec.memory, "16Gi");
        assert!(!spec.storage.persistent);
        assert!(!spec.stopped);
    }

    #[test]
    fn test_status_field_names() {
        let status = CrcClusterStatus {
            api_url: "https://api.demo-ns.apps.example.com".into(),
            console_url: "https://console-openshift-console.demo-ns.apps.example.com".into(),
            cluster_id: "1b4f".into(),
            kube_admin_password: "pw".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["apiURL"], "https://api.demo-ns.apps.example.com");
        assert_eq!(value["clusterID"], "1b4f");
        assert_eq!(value["kubeAdminPassword"], "pw");
        assert!(value.get("kubeconfig").is_none());
    }

    #[test]
    fn test_crd_restricts_names() {
        use kube::CustomResourceExt;
        let crd = serde_json::to_value(CrcCluster::crd()).unwrap();
        let name_schema = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["metadata"]["properties"]["name"];
        assert_eq!(name_schema["maxLength"], 40);
        assert_eq!(crd["spec"]["names"]["shortNames"][0], "crc");
    }
}
