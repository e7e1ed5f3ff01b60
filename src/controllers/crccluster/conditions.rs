use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::crcclusters::CrcClusterCondition;

pub const VIRTUAL_MACHINE_NOT_READY: &str = "VirtualMachineNotReady";
pub const NETWORKING_NOT_READY: &str = "NetworkingNotReady";
pub const KUBELET_NOT_READY: &str = "KubeletNotReady";
pub const CLUSTER_NOT_CONFIGURED: &str = "ClusterNotConfigured";
pub const READY: &str = "Ready";

/// The bootstrap stage of a cluster, as recorded in its status conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterStage {
    pub vm_not_ready: bool,
    pub networking_not_ready: bool,
    pub kubelet_not_ready: bool,
    pub cluster_not_configured: bool,
    pub ready: bool,
}

/// A single authoritative fact learnt during a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    VirtualMachine { ready: bool },
    Networking { ready: bool },
    KubeletStarted,
    ClusterConfigured,
    Console { reachable: bool },
}

impl ClusterStage {
    pub const INITIAL: ClusterStage = ClusterStage {
        vm_not_ready: true,
        networking_not_ready: true,
        kubelet_not_ready: true,
        cluster_not_configured: true,
        ready: false,
    };

    /// Reads the stage back from persisted conditions; `None` when they were never initialised.
    pub fn from_conditions(conditions: &[CrcClusterCondition]) -> Option<Self> {
        if conditions.is_empty() {
            return None;
        }
        let is_true = |r#type: &str, default: bool| {
            conditions
                .iter()
                .find(|c| c.r#type == r#type)
                .map_or(default, |c| c.status == "True")
        };
        let initial = Self::INITIAL;
        Some(Self {
            vm_not_ready: is_true(VIRTUAL_MACHINE_NOT_READY, initial.vm_not_ready),
            networking_not_ready: is_true(NETWORKING_NOT_READY, initial.networking_not_ready),
            kubelet_not_ready: is_true(KUBELET_NOT_READY, initial.kubelet_not_ready),
            cluster_not_configured: is_true(CLUSTER_NOT_CONFIGURED, initial.cluster_not_configured),
            ready: is_true(READY, initial.ready),
        })
    }

    /// Next stage after an observation.
    ///
    /// A VM that is not ready has lost its runtime configuration, so every later stage starts over.
    #[must_use]
    pub fn observe(self, observation: Observation) -> Self {
        match observation {
            Observation::VirtualMachine { ready: true } => Self {
                vm_not_ready: false,
                ..self
            },
            Observation::VirtualMachine { ready: false } => Self {
                vm_not_ready: true,
                kubelet_not_ready: true,
                cluster_not_configured: true,
                ready: false,
                ..self
            },
            Observation::Networking { ready } => Self {
                networking_not_ready: !ready,
                ..self
            },
            Observation::KubeletStarted => Self {
                kubelet_not_ready: false,
                ..self
            },
            Observation::ClusterConfigured => Self {
                cluster_not_configured: false,
                ..self
            },
            Observation::Console { reachable } => Self {
                ready: reachable,
                ..self
            },
        }
    }

    fn entries(&self) -> [(&'static str, bool); 5] {
        [
            (VIRTUAL_MACHINE_NOT_READY, self.vm_not_ready),
            (NETWORKING_NOT_READY, self.networking_not_ready),
            (KUBELET_NOT_READY, self.kubelet_not_ready),
            (CLUSTER_NOT_CONFIGURED, self.cluster_not_configured),
            (READY, self.ready),
        ]
    }

    /// Renders the stage as the ordered condition list, keeping transition times of unchanged entries.
    pub fn to_conditions(&self, previous: &[CrcClusterCondition], now: &Time) -> Vec<CrcClusterCondition> {
        self.entries()
            .into_iter()
            .map(|(r#type, value)| {
                let status = if value { "True" } else { "False" };
                let last_transition_time = previous
                    .iter()
                    .find(|c| c.r#type == r#type && c.status == status)
                    .and_then(|c| c.last_transition_time.clone())
                    .unwrap_or_else(|| now.clone());
                CrcClusterCondition {
                    last_transition_time: Some(last_transition_time),
                    message: None,
                    reason: None,
                    status: status.into(),
                    r#type: r#type.into(),
                }
            })
            .collect()
    }

    /// Condition types whose status differs between two stages, with the new status
    pub fn transitions(&self, to: &ClusterStage) -> Vec<(&'static str, bool)> {
        self.entries()
            .into_iter()
            .zip(to.entries())
            .filter(|((_, before), (_, after))| before != after)
            .map(|(_, after)| after)
            .collect()
    }
}
