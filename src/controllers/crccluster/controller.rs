use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::Recorder;
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, OperatorConfig, State};
use crate::resources::crcbundles::CrcBundle;
use crate::resources::crcclusters::{CrcCluster, CrcClusterStatus};
use crate::resources::kubevirt::{VirtualMachine, VirtualMachineStatus};
use crate::resources::openshift::Route;
use crate::ssh::SSH_PORT;
use crate::{telemetry, Error, Metrics, Result};

use super::access::{ClusterAccess, LiveAccess};
use super::conditions::{self, ClusterStage, Observation};
use super::reconcilers::bundle::resolve_bundle;
use super::reconcilers::exposure::{Exposure, ExternalUrls};
use super::reconcilers::kubelet::{ensure_kubelet_started, local_nameservers};
use super::reconcilers::route_helper::reconcile_route_helper;
use super::reconcilers::service::{has_cluster_ip, reconcile_service};
use super::reconcilers::stabilization::{
    console_readiness, control_plane_readiness, not_ready_pods, update_api_server_url,
};
use super::reconcilers::virtual_machine::{reconcile_virtual_machine, vm_ready};
use super::reconcilers::{
    base_metadata, cluster_config, credentials, Readiness, MANAGED_BY_SELECTOR, MANAGER,
};

// Context for our reconciler
#[derive(Clone)]
pub(super) struct Context {
    /// Kubernetes client for the hosting cluster
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Process-wide settings
    pub config: OperatorConfig,
    // Route or Ingress, decided once at startup
    pub exposure: Exposure,
    /// Shell, API and console access into provisioned clusters
    pub access: Arc<dyn ClusterAccess>,
    // Upstream resolvers of the operator pod, forwarded to by the VM's dnsmasq
    pub nameservers: String,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        exposure: Exposure,
        access: Arc<dyn ClusterAccess>,
        nameservers: String,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "crc-operator".into()),
            config: state.config().clone(),
            exposure,
            access,
            nameservers,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }

    /// Turn a step that has not converged yet into a delayed requeue
    fn defer(&self, crc: &CrcCluster, readiness: Readiness) -> Action {
        match readiness {
            Readiness::Ready => Action::await_change(),
            Readiness::NotReady {
                reason,
                message,
                requeue_after,
            } => {
                info!("CrcCluster is not yet ready: {message}");
                self.metrics.deferred(crc, reason);
                Action::requeue(requeue_after)
            }
        }
    }
}

#[instrument(skip(ctx, crc), fields(trace_id, name = %crc.name_any(), namespace = %crc.namespace().unwrap_or_default()))]
async fn reconcile(crc: Arc<CrcCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<CrcCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let crcs: Api<CrcCluster> =
        Api::namespaced(ctx.client.clone(), &crc.namespace().unwrap_or_default());

    info!("Reconciling CrcCluster \"{}\"", crc.name_any());
    // the queued copy may lag behind; status is read-modify-write against the stored object
    let result = match crcs.get_opt(&crc.name_any()).await {
        Ok(Some(current)) => current.reconcile_stages(&ctx).await,
        Ok(None) => {
            info!("CrcCluster is gone, its owned objects are garbage collected");
            Ok(Action::await_change())
        }
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &crc.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(crc.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_crc: Arc<CrcCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_permanent() {
        // retried once the CrcCluster changes
        Action::await_change()
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}

/// Writes the status of one CrcCluster, skipping writes that would change nothing
struct StatusWriter<'a> {
    api: Api<CrcCluster>,
    name: String,
    persisted: CrcClusterStatus,
    stage: Option<ClusterStage>,
    metrics: &'a Metrics,
}

impl<'a> StatusWriter<'a> {
    fn new(crc: &CrcCluster, ctx: &'a Context) -> Self {
        let persisted = crc.status.clone().unwrap_or_default();
        Self {
            api: Api::namespaced(ctx.client.clone(), &crc.namespace().unwrap_or_default()),
            name: crc.name_any(),
            stage: ClusterStage::from_conditions(&persisted.conditions),
            persisted,
            metrics: &ctx.metrics,
        }
    }

    async fn save(&mut self, stage: ClusterStage, status: &CrcClusterStatus) -> Result<()> {
        let mut next = status.clone();
        next.conditions = stage.to_conditions(&self.persisted.conditions, &Time(Utc::now()));
        if next == self.persisted {
            return Ok(());
        }

        debug!("Updating CrcCluster status");
        let patch = Patch::Apply(json!({
            "apiVersion": CrcCluster::api_version(&()),
            "kind": CrcCluster::kind(&()),
            "status": next,
        }));
        let params = PatchParams::apply(MANAGER).force();
        self.api.patch_status(&self.name, &params, &patch).await?;

        if let Some(previous) = self.stage {
            for (r#type, value) in previous.transitions(&stage) {
                info!("Condition {} is now {}", r#type, value);
                self.metrics
                    .condition_changed(r#type, if value { "True" } else { "False" });
            }
        }
        self.persisted = next;
        self.stage = Some(stage);
        Ok(())
    }
}

impl CrcCluster {
    /// One pass over the bootstrap stages, each gated on the conditions recorded by the previous ones
    async fn reconcile_stages(&self, ctx: &Context) -> Result<Action> {
        let mut status = self.status.clone().unwrap_or_default();
        let mut writer = StatusWriter::new(self, ctx);
        let mut stage = match writer.stage {
            Some(stage) => stage,
            None => {
                info!("Initializing status conditions");
                writer.save(ClusterStage::INITIAL, &status).await?;
                ClusterStage::INITIAL
            }
        };

        let base_metadata = base_metadata(self)?;
        let bundle = resolve_bundle(&ctx.client, &ctx.config, &self.spec).await?;
        let vm =
            reconcile_virtual_machine(&ctx.client, &base_metadata, &self.spec, &bundle).await?;
        let service = reconcile_service(&ctx.client, &base_metadata).await?;
        let api_host = ctx.exposure.ensure(&ctx.client, &base_metadata).await?;
        if let Some(host) = api_host.as_deref() {
            let urls = ExternalUrls::from_api_host(host);
            status.base_domain = urls.base_domain;
            status.api_url = urls.api_url;
            status.console_url = urls.console_url;
        }
        status.stopped = vm.spec.running == Some(false);

        stage = stage
            .observe(Observation::VirtualMachine {
                ready: vm_ready(&vm),
            })
            .observe(Observation::Networking {
                ready: has_cluster_ip(&service) && api_host.is_some(),
            });
        writer.save(stage, &status).await?;

        if stage.vm_not_ready {
            if status.stopped {
                info!("Cluster is stopped and its VirtualMachine is not ready, as expected");
                return Ok(Action::await_change());
            }
            return Ok(ctx.defer(
                self,
                Readiness::not_ready(
                    conditions::VIRTUAL_MACHINE_NOT_READY,
                    "Waiting on the VirtualMachine to become Ready",
                    10,
                ),
            ));
        }
        if stage.networking_not_ready {
            return Ok(ctx.defer(
                self,
                Readiness::not_ready(
                    conditions::NETWORKING_NOT_READY,
                    "Waiting on the Service and API exposure to get an address",
                    10,
                ),
            ));
        }

        let cluster_ip = service
            .spec
            .as_ref()
            .and_then(|spec| spec.cluster_ip.as_deref())
            .unwrap_or_default();
        let shell = ctx
            .access
            .shell(cluster_ip, SSH_PORT, &bundle.ssh_private_key)?;

        if stage.kubelet_not_ready {
            ensure_kubelet_started(shell.as_ref(), &status.base_domain, &ctx.nameservers).await?;
            stage = stage.observe(Observation::KubeletStarted);
            writer.save(stage, &status).await?;
        }

        if credentials::ensure_credentials(&mut status).await? {
            writer.save(stage, &status).await?;
        }

        let remote = ctx.access.cluster_client(&bundle, &status.api_url).await?;
        if stage.cluster_not_configured {
            if cluster_config::configure_access(&remote, shell.as_ref(), &self.spec, &mut status).await? {
                writer.save(stage, &status).await?;
            }
            cluster_config::configure_cluster(&remote, &status).await?;
            stage = stage.observe(Observation::ClusterConfigured);
            writer.save(stage, &status).await?;
        }

        debug!("Ensuring ingress controllers follow {}", status.base_domain);
        cluster_config::align_ingress_controller(&remote, &status.base_domain).await?;
        let deleted = cluster_config::delete_terminating_router_pods(&remote).await?;
        if deleted > 0 {
            info!("Deleted {deleted} terminating router pods");
        }

        if let not_ready @ Readiness::NotReady { .. } = control_plane_readiness(&remote).await? {
            return Ok(ctx.defer(self, not_ready));
        }

        update_api_server_url(&remote, &status.api_url).await?;
        if cluster_config::update_default_routes(&remote, &status.base_domain).await? {
            return Ok(ctx.defer(
                self,
                Readiness::not_ready("RoutesUpdated", "Waiting on rewritten default routes", 20),
            ));
        }

        let pods = not_ready_pods(&remote).await?;
        if !pods.is_empty() {
            return Ok(ctx.defer(
                self,
                Readiness::not_ready(
                    "PodsNotReady",
                    format!("Still waiting on pods {}", pods.join(", ")),
                    10,
                ),
            ));
        }

        reconcile_route_helper(&ctx.client, &base_metadata, &ctx.config).await?;

        let console = console_readiness(ctx.access.console_status(&status.console_url).await);
        let was_ready = stage.ready;
        stage = stage.observe(Observation::Console {
            reachable: console.is_ready(),
        });
        writer.save(stage, &status).await?;

        match console {
            Readiness::Ready => {
                if !was_ready {
                    ctx.recorder
                        .publish(
                            &Event {
                                type_: EventType::Normal,
                                reason: "ClusterReady".into(),
                                note: Some(format!("Console is up at {}", status.console_url)),
                                action: "Reconcile".into(),
                                secondary: None,
                            },
                            &self.object_ref(&()),
                        )
                        .await?;
                }
                Ok(Action::await_change())
            }
            not_ready => Ok(ctx.defer(self, not_ready)),
        }
    }
}

// Initialize the controller and shared state (given the crds are installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let api_groups = match client.list_api_groups().await {
        Ok(list) => list,
        Err(e) => {
            error!("Could not list api groups: {e:?}");
            std::process::exit(1);
        }
    };
    let exposure = Exposure::detect(&api_groups);
    info!("Exposing cluster APIs with {exposure:?} objects");

    let crc_api = Api::<CrcCluster>::all(client.clone());
    let bundle_api = Api::<CrcBundle>::namespaced(client.clone(), &state.config().bundle_namespace);

    if let Err(e) = crc_api.list(&ListParams::default().limit(1)).await {
        error!("CrcCluster is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    if let Err(e) = bundle_api.list(&ListParams::default().limit(1)).await {
        error!("CrcBundle is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let access = match LiveAccess::new() {
        Ok(access) => access,
        Err(e) => {
            error!("Could not build the console client: {e:?}");
            std::process::exit(1);
        }
    };
    let nameservers = match local_nameservers().await {
        Ok(nameservers) => nameservers,
        Err(e) => {
            warn!("Could not read upstream nameservers, VMs resolve through dnsmasq only: {e}");
            String::new()
        }
    };

    // all resources we create carry this label
    let cfg = Config::default().labels(MANAGED_BY_SELECTOR);

    let vm_watcher = watcher(Api::<VirtualMachine>::all(client.clone()), cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // readiness only shows in the status
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let svc_watcher = watcher(Api::<Service>::all(client.clone()), cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // svc has no generation so we hash the spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let deploy_watcher = metadata_watcher(Api::<Deployment>::all(client.clone()), cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let controller = Controller::new(crc_api, Config::default())
        .with_config(ControllerConfig::default().concurrency(state.config().concurrency))
        .shutdown_on_signal()
        .owns_stream(vm_watcher)
        .owns_stream(svc_watcher)
        .owns_stream(deploy_watcher);
    let controller = match exposure {
        Exposure::Route => {
            let route_watcher = metadata_watcher(Api::<Route>::all(client.clone()), cfg.clone())
                .map(|event| ensure_deletion_change(event))
                .touched_objects()
                .predicate_filter(changed_predicate);
            controller.owns_stream(route_watcher)
        }
        Exposure::Ingress => {
            let ingress_watcher =
                metadata_watcher(Api::<Ingress>::all(client.clone()), cfg.clone())
                    .map(|event| ensure_deletion_change(event))
                    .touched_objects()
                    .predicate_filter(changed_predicate);
            controller.owns_stream(ingress_watcher)
        }
    };

    controller
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, exposure, Arc::new(access), nameservers),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for VirtualMachine {
    type Status = VirtualMachineStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        serde_hashkey::to_key(s)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    }
    Some(hasher.finish())
}

trait MyHasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl MyHasSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

fn spec_predicate_serde<K: Resource + MyHasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec())
        .expect("serde_hashkey never to return an error")
        .hash(&mut hasher);
    Some(hasher.finish())
}
