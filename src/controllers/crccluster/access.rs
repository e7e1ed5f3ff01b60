use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use reqwest::StatusCode;

use crate::ssh::{RemoteShell, SshShell};
use crate::Result;

use super::reconcilers::bundle::ResolvedBundle;
use super::reconcilers::stabilization::probe_console;

/// The ways the operator reaches into a provisioned cluster: its node shell, its API and its console
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    fn shell(&self, host: &str, port: u16, private_key_pem: &str) -> Result<Arc<dyn RemoteShell>>;

    async fn cluster_client(&self, bundle: &ResolvedBundle, api_url: &str) -> Result<Client>;

    /// Status code of a GET against the console, `None` when nothing answered
    async fn console_status(&self, console_url: &str) -> Option<StatusCode>;
}

pub struct LiveAccess {
    http: reqwest::Client,
}

impl LiveAccess {
    pub fn new() -> Result<Self> {
        // consoles serve the bundle's self-signed chain until a real certificate is configured
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ClusterAccess for LiveAccess {
    fn shell(&self, host: &str, port: u16, private_key_pem: &str) -> Result<Arc<dyn RemoteShell>> {
        Ok(Arc::new(SshShell::new(host, port, private_key_pem)?))
    }

    async fn cluster_client(&self, bundle: &ResolvedBundle, api_url: &str) -> Result<Client> {
        bundle.cluster_client(api_url).await
    }

    async fn console_status(&self, console_url: &str) -> Option<StatusCode> {
        probe_console(&self.http, console_url).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::controllers::crccluster::test_support::FakeApiServer;
    use crate::ssh::fake::TranscriptShell;

    /// Hands out one transcript shell, one fake remote API server and a fixed console answer
    pub struct FakeAccess {
        pub shell: Arc<TranscriptShell>,
        pub remote: FakeApiServer,
        pub console: Option<StatusCode>,
    }

    #[async_trait]
    impl ClusterAccess for FakeAccess {
        fn shell(&self, _host: &str, _port: u16, _private_key_pem: &str) -> Result<Arc<dyn RemoteShell>> {
            Ok(self.shell.clone())
        }

        async fn cluster_client(&self, _bundle: &ResolvedBundle, _api_url: &str) -> Result<Client> {
            Ok(self.remote.client())
        }

        async fn console_status(&self, _console_url: &str) -> Option<StatusCode> {
            self.console
        }
    }
}
