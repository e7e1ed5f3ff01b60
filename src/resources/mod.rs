pub mod crcbundles;
pub mod crcclusters;
/// KubeVirt and CDI kinds backing the cluster VM
pub mod kubevirt;
/// OpenShift kinds, both on the hosting cluster and inside the provisioned one
pub mod openshift;
