use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An immutable bootable disk image together with the credentials baked into it
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "CrcBundle",
    group = "crc.developer.openshift.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Disk Size", "type":"string", "jsonPath":".spec.diskSize"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CrcBundleSpec {
    /// Container disk image holding the VM root disk
    pub image: String,
    /// Minimum size of the root disk, as a Kubernetes quantity
    pub disk_size: String,
    /// Base64-encoded PEM private key accepted by the core user of the VM
    pub ssh_key: String,
    /// Base64-encoded kubeconfig with admin access to the cluster inside the image
    pub kubeconfig: String,
}
