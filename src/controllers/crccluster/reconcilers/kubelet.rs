use tracing::{debug, info};

use crate::ssh::RemoteShell;
use crate::{Error, Result};

const KUBELET_RUNNING: &str = "__kubelet_running: true";

const KUBELET_PROBE: &str = r#"sudo systemctl status kubelet; if [ $? == 0 ]; then echo "__kubelet_running: true"; else echo "__kubelet_running: false"; fi"#;

const START_KUBELET: &str = include_str!("scripts/start_kubelet.sh");

/// Fill in the bootstrap script for a cluster reachable under `base_domain`
pub fn start_kubelet_script(base_domain: &str, nameservers: &str) -> String {
    START_KUBELET
        .replace("{{base_domain}}", base_domain)
        .replace("{{nameservers}}", nameservers.trim_end())
}

/// `nameserver` lines of a resolv.conf, to be appended after the node-local resolver
pub fn nameserver_lines(resolv_conf: &str) -> String {
    resolv_conf
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("nameserver"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Upstream resolvers of the operator pod, which the VM forwards external lookups to
pub async fn local_nameservers() -> Result<String> {
    let resolv_conf = tokio::fs::read_to_string("/etc/resolv.conf").await?;
    Ok(nameserver_lines(&resolv_conf))
}

/// Make sure the kubelet runs in the VM, running the bootstrap script only when it does not.
pub async fn ensure_kubelet_started(
    shell: &dyn RemoteShell,
    base_domain: &str,
    nameservers: &str,
) -> Result<()> {
    let status = shell.output(KUBELET_PROBE).await?;
    if status.contains(KUBELET_RUNNING) {
        debug!("Kubelet already running");
        return Ok(());
    }

    info!("Starting kubelet in the VirtualMachine");
    let output = shell
        .output(&start_kubelet_script(base_domain, nameservers))
        .await?;
    if !output.contains(KUBELET_RUNNING) {
        debug!("Bootstrap output: {output}");
        return Err(Error::KubeletNotStarted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::TranscriptShell;

    #[test]
    fn test_script_parameters() {
        let script = start_kubelet_script(
            "demo-dev.apps.example.com",
            "nameserver 10.96.0.10\nnameserver 1.1.1.1\n",
        );
        assert!(script.contains("address=/demo-dev.apps.example.com/10.0.2.2"));
        assert!(script.contains("nameserver 10.88.0.8\nnameserver 10.96.0.10\nnameserver 1.1.1.1\""));
        assert!(!script.contains("{{"));
        assert!(script.starts_with("set -e"));
    }

    #[test]
    fn test_nameserver_lines() {
        let resolv = "search dev.svc.cluster.local svc.cluster.local\nnameserver 10.96.0.10\noptions ndots:5\n";
        assert_eq!(nameserver_lines(resolv), "nameserver 10.96.0.10");
    }

    #[tokio::test]
    async fn test_running_kubelet_skips_bootstrap() {
        let shell = TranscriptShell::new(vec![Ok("active (running)\n__kubelet_running: true\n".into())]);
        ensure_kubelet_started(&shell, "demo-dev.apps.example.com", "")
            .await
            .unwrap();
        assert_eq!(shell.scripts().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_kubelet_runs_bootstrap() {
        let shell = TranscriptShell::new(vec![
            Ok("inactive (dead)\n__kubelet_running: false\n".into()),
            Ok(">> Starting Kubelet.\n__kubelet_running: true\n".into()),
        ]);
        ensure_kubelet_started(&shell, "demo-dev.apps.example.com", "nameserver 1.1.1.1")
            .await
            .unwrap();
        let scripts = shell.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[1].contains("sudo systemctl start kubelet"));
    }

    #[tokio::test]
    async fn test_bootstrap_without_sentinel_fails() {
        let shell = TranscriptShell::new(vec![
            Ok("__kubelet_running: false\n".into()),
            Ok(">> Verifying DNS setup.\n".into()),
        ]);
        let result = ensure_kubelet_started(&shell, "demo-dev.apps.example.com", "").await;
        assert!(matches!(result, Err(Error::KubeletNotStarted)));
    }

    #[tokio::test]
    async fn test_bootstrap_script_failure_propagates() {
        let shell = TranscriptShell::new(vec![
            Ok("__kubelet_running: false\n".into()),
            Err(Error::RemoteCommandFailed {
                exit_status: 1,
                output: "host: couldn't get address for 'quay.io'".into(),
            }),
        ]);
        let result = ensure_kubelet_started(&shell, "demo-dev.apps.example.com", "").await;
        assert!(matches!(
            result,
            Err(Error::RemoteCommandFailed { exit_status: 1, .. })
        ));
    }
}
