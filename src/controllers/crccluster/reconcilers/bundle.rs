use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use crate::controllers::OperatorConfig;
use crate::resources::crcbundles::CrcBundle;
use crate::resources::crcclusters::CrcClusterSpec;
use crate::{Error, Result};

use super::quantity::QuantityParser;

/// A CrcBundle picked for a cluster, with its secrets decoded
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedBundle {
    pub name: String,
    pub image: String,
    pub disk_size: String,
    pub ssh_private_key: String,
    pub seed_kubeconfig: String,
    /// Size of the persistent root disk, when the cluster asks for one
    pub persistent_disk_size: Option<String>,
}

impl ResolvedBundle {
    fn from_bundle(bundle: &CrcBundle, image_override: Option<&str>) -> Result<Self> {
        Ok(Self {
            name: bundle.name_any(),
            image: image_override.unwrap_or(&bundle.spec.image).to_string(),
            disk_size: bundle.spec.disk_size.clone(),
            ssh_private_key: decode_text(&bundle.spec.ssh_key)?,
            seed_kubeconfig: decode_text(&bundle.spec.kubeconfig)?,
            persistent_disk_size: None,
        })
    }

    /// Client for the cluster inside the VM, reached through its external API address.
    ///
    /// The seed credentials come from the bundle; the cluster still serves its self-signed
    /// chain at this point, so certificate validation is off.
    pub async fn cluster_client(&self, api_url: &str) -> Result<Client> {
        let mut kubeconfig = Kubeconfig::from_yaml(&self.seed_kubeconfig)?;
        for named in kubeconfig.clusters.iter_mut() {
            if let Some(cluster) = named.cluster.as_mut() {
                cluster.server = Some(api_url.to_string());
                cluster.insecure_skip_tls_verify = Some(true);
                cluster.certificate_authority = None;
                cluster.certificate_authority_data = None;
            }
        }
        let mut config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?;
        config.accept_invalid_certs = true;
        config.root_cert = None;
        Ok(Client::try_from(config)?)
    }
}

fn decode_text(encoded: &str) -> Result<String> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Pick the bundle for a cluster: an exact image match wins, otherwise the named (or default) bundle
/// booting the override image if one was given.
pub fn select_bundle<'a>(
    bundles: &'a [CrcBundle],
    bundle_name: &str,
    bundle_image: Option<&str>,
) -> Result<&'a CrcBundle> {
    if let Some(image) = bundle_image {
        if let Some(bundle) = bundles.iter().find(|b| b.spec.image == image) {
            return Ok(bundle);
        }
        debug!("No bundle ships image {image}, falling back to bundle {bundle_name}");
    }
    bundles
        .iter()
        .find(|b| b.name_any() == bundle_name)
        .ok_or_else(|| match bundle_image {
            Some(image) => Error::BundleNotFound(format!("image {image} or name {bundle_name}")),
            None => Error::BundleNotFound(format!("name {bundle_name}")),
        })
}

/// Check a persistent disk request against the bundle's minimum and settle its size.
pub fn persistent_disk_size(spec: &CrcClusterSpec, bundle: &ResolvedBundle) -> Result<Option<String>> {
    if !spec.storage.persistent {
        return Ok(None);
    }
    let minimum = Quantity(bundle.disk_size.clone()).to_bytes()?;
    match &spec.storage.size {
        Some(requested) => {
            if Quantity(requested.clone()).to_bytes()? < minimum {
                return Err(Error::InsufficientStorage {
                    requested: requested.clone(),
                    minimum: bundle.disk_size.clone(),
                    bundle: bundle.name.clone(),
                });
            }
            Ok(Some(requested.clone()))
        }
        None => Ok(Some(bundle.disk_size.clone())),
    }
}

/// Resolve and validate the bundle for a CrcCluster. Read-only.
pub async fn resolve_bundle(
    client: &Client,
    config: &OperatorConfig,
    spec: &CrcClusterSpec,
) -> Result<ResolvedBundle> {
    let bundles: Api<CrcBundle> = Api::namespaced(client.clone(), &config.bundle_namespace);
    let bundle_name = spec
        .bundle_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&config.default_bundle_name);
    let bundle_image = spec.bundle_image.as_deref().filter(|image| !image.is_empty());

    let candidates = match bundle_image {
        Some(_) => bundles.list(&ListParams::default()).await?.items,
        None => bundles.get_opt(bundle_name).await?.into_iter().collect(),
    };
    let selected = select_bundle(&candidates, bundle_name, bundle_image)?;
    let override_image = bundle_image.filter(|image| *image != selected.spec.image);

    let mut resolved = ResolvedBundle::from_bundle(selected, override_image)?;
    resolved.persistent_disk_size = persistent_disk_size(spec, &resolved)?;
    info!(
        "Located bundle {} with image {}",
        resolved.name, resolved.image
    );
    Ok(resolved)
}
