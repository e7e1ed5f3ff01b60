use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use rand::rngs::OsRng;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde_json::json;
use tracing::{debug, info};

use crate::resources::crcclusters::CrcClusterStatus;
use crate::{Error, Result};

pub const ADMIN_USER: &str = "kubeadmin";
const ADMIN_CSR: &str = "crc-cluster-admin";
const CLIENT_KEY_BITS: usize = 4096;

// no l, O, 0 or 1
const PASSWORD_ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHIJKLMNPQRSTUVWXYZ23456789";

/// Four groups of five characters joined by dashes
pub fn generate_password() -> String {
    let mut rng = OsRng;
    (0..4)
        .map(|_| {
            (0..5)
                .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

async fn generate_client_key() -> Result<String> {
    let pem = tokio::task::spawn_blocking(|| -> Result<String> {
        let key = RsaPrivateKey::new(&mut OsRng, CLIENT_KEY_BITS)?;
        Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
    })
    .await??;
    Ok(STANDARD.encode(pem))
}

/// Generate the cluster ID, admin password and client key, each only if the status has none yet.
///
/// Returns whether anything was generated.
pub async fn ensure_credentials(status: &mut CrcClusterStatus) -> Result<bool> {
    let mut generated = false;
    if status.cluster_id.is_empty() {
        status.cluster_id = uuid::Uuid::new_v4().to_string();
        generated = true;
    }
    if status.kube_admin_password.is_empty() {
        status.kube_admin_password = generate_password();
        generated = true;
    }
    if status.kube_admin_client_key.is_empty() {
        info!("Generating kubeadmin client key");
        status.kube_admin_client_key = generate_client_key().await?;
        generated = true;
    }
    Ok(generated)
}

/// PEM certificate request for `CN=kubeadmin`, signed with the given private key
pub fn certificate_request_pem(key_pem: &str) -> Result<String> {
    let key_pair = KeyPair::from_pem(key_pem)?;
    let mut params = CertificateParams::default();
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, ADMIN_USER);
    params.distinguished_name = subject;
    Ok(params.serialize_request(&key_pair)?.pem()?)
}

fn admin_csr(request_pem: String) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(ADMIN_CSR.into()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request_pem.into_bytes()),
            signer_name: "kubernetes.io/kube-apiserver-client".into(),
            usages: Some(vec!["client auth".into()]),
            groups: Some(vec!["cluster-admin".into()]),
            ..Default::default()
        },
        status: None,
    }
}

fn is_decided(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
}

/// Approve a certificate request unless it was already approved or denied
pub async fn approve(api: &Api<CertificateSigningRequest>, csr: &CertificateSigningRequest) -> Result<bool> {
    if is_decided(csr) {
        return Ok(false);
    }
    let mut conditions = csr
        .status
        .as_ref()
        .and_then(|status| status.conditions.clone())
        .unwrap_or_default();
    conditions.push(CertificateSigningRequestCondition {
        type_: "Approved".into(),
        status: "True".into(),
        reason: Some("CRCApprove".into()),
        message: Some("This CSR was approved by the CodeReady Containers operator.".into()),
        last_update_time: Some(Time(chrono::Utc::now())),
        ..Default::default()
    });
    let patch = json!({"status": {"conditions": conditions}});
    debug!("Approving CertificateSigningRequest {}", csr.name_any());
    api.patch_approval(&csr.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Approve every pending certificate request in the cluster
pub async fn approve_pending(client: &Client) -> Result<usize> {
    let api: Api<CertificateSigningRequest> = Api::all(client.clone());
    let mut approved = 0;
    for csr in api.list(&ListParams::default()).await? {
        if approve(&api, &csr).await? {
            approved += 1;
        }
    }
    Ok(approved)
}

/// Kubeconfig for the kubeadmin user authenticating with its client certificate
pub fn admin_kubeconfig(api_url: &str, certificate_b64: &str, client_key_b64: &str) -> Result<String> {
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "crc",
            "cluster": {"server": api_url, "insecure-skip-tls-verify": true}
        }],
        "contexts": [{
            "name": ADMIN_USER,
            "context": {"cluster": "crc", "user": ADMIN_USER}
        }],
        "current-context": ADMIN_USER,
        "preferences": {},
        "users": [{
            "name": ADMIN_USER,
            "user": {
                "client-certificate-data": certificate_b64,
                "client-key-data": client_key_b64
            }
        }]
    });
    Ok(serde_yaml::to_string(&kubeconfig)?)
}

/// Issue the kubeadmin client certificate in the provisioned cluster and record a kubeconfig for it.
///
/// Does nothing once the status carries a kubeconfig.
pub async fn ensure_admin_kubeconfig(client: &Client, status: &mut CrcClusterStatus) -> Result<bool> {
    if !status.kubeconfig.is_empty() {
        return Ok(false);
    }

    let api: Api<CertificateSigningRequest> = Api::all(client.clone());
    let csr = match api.get_opt(ADMIN_CSR).await? {
        Some(csr) => csr,
        None => {
            let key_pem = String::from_utf8_lossy(&STANDARD.decode(&status.kube_admin_client_key)?).into_owned();
            let csr = admin_csr(certificate_request_pem(&key_pem)?);
            info!("Requesting kubeadmin client certificate");
            api.create(&PostParams::default(), &csr).await?
        }
    };
    approve(&api, &csr).await?;

    let certificate = api
        .get(ADMIN_CSR)
        .await?
        .status
        .and_then(|status| status.certificate)
        .filter(|certificate| !certificate.0.is_empty())
        .ok_or_else(|| Error::CertificateNotIssued(ADMIN_CSR.into()))?;

    let kubeconfig = admin_kubeconfig(
        &status.api_url,
        &STANDARD.encode(&certificate.0),
        &status.kube_admin_client_key,
    )?;
    status.kubeconfig = STANDARD.encode(kubeconfig);
    Ok(true)
}
