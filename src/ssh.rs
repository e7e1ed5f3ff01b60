use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;
use tracing::debug;

use crate::{Error, Result};

/// Port the cluster Service forwards to the VM's sshd
pub const SSH_PORT: u16 = 2022;
const SSH_USER: &str = "core";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that can run a POSIX shell script on a cluster node and return its combined output
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn output(&self, script: &str) -> Result<String>;
}

/// Public-key authenticated ssh access to the `core` user of a cluster VM
pub struct SshShell {
    host: String,
    port: u16,
    key: Arc<key::KeyPair>,
}

impl SshShell {
    pub fn new(host: impl Into<String>, port: u16, private_key_pem: &str) -> Result<Self> {
        let key = russh_keys::decode_secret_key(private_key_pem, None)?;
        Ok(Self {
            host: host.into(),
            port,
            key: Arc::new(key),
        })
    }

    async fn connect(&self) -> Result<client::Handle<AcceptAnyHostKey>> {
        let config = Arc::new(client::Config::default());
        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, (self.host.as_str(), self.port), AcceptAnyHostKey),
        )
        .await
        .map_err(|_| Error::SshConnectTimeout(format!("{}:{}", self.host, self.port)))??;

        if !session
            .authenticate_publickey(SSH_USER, self.key.clone())
            .await?
        {
            return Err(Error::SshAuthenticationFailed(SSH_USER.into()));
        }
        Ok(session)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn output(&self, script: &str) -> Result<String> {
        let session = self.connect().await?;
        let mut channel = session.channel_open_session().await?;
        channel.exec(true, script).await?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }
        if let Err(e) = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to close ssh session to {}: {}", self.host, e);
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        debug!("Remote command on {} exited with {:?}", self.host, exit_status);
        match exit_status {
            Some(0) => Ok(output),
            Some(exit_status) => Err(Error::RemoteCommandFailed {
                exit_status,
                output,
            }),
            // sshd closed the channel without reporting a status
            None => Err(Error::RemoteCommandFailed {
                exit_status: u32::MAX,
                output,
            }),
        }
    }
}

// cluster VMs are disposable and regenerate host keys on every boot
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
