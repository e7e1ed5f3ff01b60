//! External exposure of a cluster's API port.
//!
//! Hosting clusters that serve `route.openshift.io/v1` get a passthrough Route; all others get a
//! networking/v1 Ingress for the nginx ingress controller with ssl-passthrough enabled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Api, Client};
use tracing::debug;

use crate::resources::openshift::{
    ClusterIngress, Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig,
};
use crate::{Error, Result};

use super::service::API_PORT;
use super::{apply_if_changed, cluster_name, object_meta};

const NGINX_NAMESPACE: &str = "ingress-nginx";
const NGINX_CONTROLLER_SERVICE: &str = "nginx-ingress-ingress-nginx-controller";

/// How the API of a cluster is made reachable from outside the hosting cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exposure {
    Route,
    Ingress,
}

impl Exposure {
    /// Select the flavour once, from the API groups served by the hosting cluster
    pub fn detect(groups: &APIGroupList) -> Self {
        let serves_routes = groups.groups.iter().any(|group| {
            group.name == "route.openshift.io"
                && group.versions.iter().any(|v| v.version == "v1")
        });
        if serves_routes {
            Exposure::Route
        } else {
            Exposure::Ingress
        }
    }

    /// Create or update the exposure object, returning the externally reachable API host once one is known.
    pub async fn ensure(&self, client: &Client, base_metadata: &ObjectMeta) -> Result<Option<String>> {
        match self {
            Exposure::Route => ensure_route(client, base_metadata).await,
            Exposure::Ingress => ensure_ingress(client, base_metadata).await,
        }
    }
}

fn exposure_name(base_metadata: &ObjectMeta) -> String {
    format!("{}-api", cluster_name(base_metadata))
}

/// Host of the cluster API below some parent domain
pub fn api_host(base_metadata: &ObjectMeta, parent_domain: &str) -> String {
    format!(
        "api.{}-{}.{}",
        cluster_name(base_metadata),
        base_metadata.namespace.as_deref().unwrap_or_default(),
        parent_domain
    )
}

fn api_route(base_metadata: &ObjectMeta, host: String) -> Route {
    Route {
        metadata: object_meta(base_metadata, exposure_name(base_metadata)),
        spec: RouteSpec {
            host: Some(host),
            to: RouteTargetReference {
                kind: "Service".into(),
                name: cluster_name(base_metadata).into(),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: IntOrString::Int(API_PORT),
            }),
            tls: Some(TlsConfig {
                termination: "passthrough".into(),
            }),
        },
    }
}

async fn ensure_route(client: &Client, base_metadata: &ObjectMeta) -> Result<Option<String>> {
    let ingress_config: Api<ClusterIngress> = Api::all(client.clone());
    let domain = ingress_config.get("cluster").await?.spec.domain;
    if domain.is_empty() {
        return Err(Error::MissingObjectKey("ingresses.config.openshift.io/cluster .spec.domain"));
    }

    let namespace = base_metadata.namespace.as_deref().unwrap_or_default();
    let route_api: Api<Route> = Api::namespaced(client.clone(), namespace);
    let route = apply_if_changed(&route_api, api_route(base_metadata, api_host(base_metadata, &domain))).await?;
    Ok(route.spec.host.filter(|host| !host.is_empty()))
}

fn api_ingress(base_metadata: &ObjectMeta, host: String) -> Ingress {
    let mut metadata = object_meta(base_metadata, exposure_name(base_metadata));
    metadata.annotations = Some(BTreeMap::from([
        ("kubernetes.io/ingress.allow-http".into(), "false".into()),
        ("nginx.ingress.kubernetes.io/ssl-passthrough".into(), "true".into()),
        ("nginx.ingress.kubernetes.io/backend-protocol".into(), "HTTPS".into()),
    ]));
    Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: cluster_name(base_metadata).into(),
                                port: Some(ServiceBackendPort {
                                    number: Some(API_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Public host of the nginx ingress controller's load balancer
pub fn load_balancer_host(controller: &Service) -> Option<String> {
    let ingress = controller
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    if let Some(hostname) = ingress.hostname.as_deref().filter(|h| !h.is_empty()) {
        return Some(hostname.to_string());
    }
    ingress
        .ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("{ip}.nip.io"))
}

async fn ensure_ingress(client: &Client, base_metadata: &ObjectMeta) -> Result<Option<String>> {
    let controller_api: Api<Service> = Api::namespaced(client.clone(), NGINX_NAMESPACE);
    let lb_host = controller_api
        .get_opt(NGINX_CONTROLLER_SERVICE)
        .await?
        .as_ref()
        .and_then(load_balancer_host);
    let Some(lb_host) = lb_host else {
        debug!("The nginx ingress controller has no load balancer address yet");
        return Ok(None);
    };

    let namespace = base_metadata.namespace.as_deref().unwrap_or_default();
    let ingress_api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let ingress = apply_if_changed(&ingress_api, api_ingress(base_metadata, api_host(base_metadata, &lb_host))).await?;
    Ok(ingress
        .spec
        .and_then(|spec| spec.rules)
        .and_then(|rules| rules.into_iter().next())
        .and_then(|rule| rule.host))
}

/// Addresses a cluster is reachable at, all derived from its API host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalUrls {
    pub base_domain: String,
    pub api_url: String,
    pub console_url: String,
}

impl ExternalUrls {
    pub fn from_api_host(host: &str) -> Self {
        let base_domain = host.strip_prefix("api.").unwrap_or(host).to_string();
        Self {
            api_url: format!("https://{host}"),
            console_url: format!("https://{}", route_host_for_domain("console", "openshift-console", &base_domain)),
            base_domain,
        }
    }
}

/// Host a default Route gets under a cluster's base domain
pub fn route_host_for_domain(route: &str, namespace: &str, base_domain: &str) -> String {
    format!("{route}-{namespace}.{base_domain}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::crccluster::reconcilers::base_metadata;
    use crate::controllers::crccluster::test_support::{cluster, FakeApiServer};
    use serde_json::json;

    #[test]
    fn test_detect_route_capability() {
        let with_routes: APIGroupList = serde_json::from_value(json!({
            "kind": "APIGroupList",
            "apiVersion": "v1",
            "groups": [
                {"name": "apps", "versions": [{"groupVersion": "apps/v1", "version": "v1"}]},
                {"name": "route.openshift.io", "versions": [{"groupVersion": "route.openshift.io/v1", "version": "v1"}]}
            ]
        }))
        .unwrap();
        assert_eq!(Exposure::detect(&with_routes), Exposure::Route);

        let without: APIGroupList = serde_json::from_value(json!({
            "kind": "APIGroupList",
            "apiVersion": "v1",
            "groups": [{"name": "apps", "versions": [{"groupVersion": "apps/v1", "version": "v1"}]}]
        }))
        .unwrap();
        assert_eq!(Exposure::detect(&without), Exposure::Ingress);
    }

    #[test]
    fn test_external_urls() {
        let urls = ExternalUrls::from_api_host("api.demo-dev.apps.example.com");
        assert_eq!(urls.api_url, "https://api.demo-dev.apps.example.com");
        assert_eq!(urls.base_domain, "demo-dev.apps.example.com");
        assert_eq!(
            urls.console_url,
            "https://console-openshift-console.demo-dev.apps.example.com"
        );
    }

    #[test]
    fn test_load_balancer_host_prefers_hostname() {
        let svc: Service = serde_json::from_value(json!({
            "metadata": {"name": NGINX_CONTROLLER_SERVICE},
            "status": {"loadBalancer": {"ingress": [{"ip": "203.0.113.7"}]}}
        }))
        .unwrap();
        assert_eq!(load_balancer_host(&svc), Some("203.0.113.7.nip.io".into()));

        let svc: Service = serde_json::from_value(json!({
            "metadata": {"name": NGINX_CONTROLLER_SERVICE},
            "status": {"loadBalancer": {"ingress": [{"hostname": "lb.example.com", "ip": "203.0.113.7"}]}}
        }))
        .unwrap();
        assert_eq!(load_balancer_host(&svc), Some("lb.example.com".into()));

        assert_eq!(load_balancer_host(&Service::default()), None);
    }

    #[tokio::test]
    async fn test_route_host_follows_hosting_domain() {
        let server = FakeApiServer::new();
        server.seed(
            "/apis/config.openshift.io/v1/ingresses/cluster",
            json!({
                "apiVersion": "config.openshift.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "cluster"},
                "spec": {"domain": "apps.example.com"}
            }),
        );
        let base = base_metadata(&cluster("demo", "dev")).unwrap();
        let host = Exposure::Route.ensure(&server.client(), &base).await.unwrap();
        assert_eq!(host.as_deref(), Some("api.demo-dev.apps.example.com"));

        let route = server
            .object("/apis/route.openshift.io/v1/namespaces/dev/routes/demo-api")
            .unwrap();
        assert_eq!(route["spec"]["tls"]["termination"], "passthrough");
        assert_eq!(route["spec"]["port"]["targetPort"], 6443);
    }

    #[tokio::test]
    async fn test_ingress_waits_for_load_balancer() {
        let server = FakeApiServer::new();
        let base = base_metadata(&cluster("demo", "dev")).unwrap();
        assert_eq!(
            Exposure::Ingress.ensure(&server.client(), &base).await.unwrap(),
            None
        );
        assert!(server.writes().is_empty());

        server.seed(
            "/api/v1/namespaces/ingress-nginx/services/nginx-ingress-ingress-nginx-controller",
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": NGINX_CONTROLLER_SERVICE, "namespace": NGINX_NAMESPACE},
                "status": {"loadBalancer": {"ingress": [{"ip": "203.0.113.7"}]}}
            }),
        );
        let host = Exposure::Ingress.ensure(&server.client(), &base).await.unwrap();
        assert_eq!(host.as_deref(), Some("api.demo-dev.203.0.113.7.nip.io"));

        let path = "/apis/networking.k8s.io/v1/namespaces/dev/ingresses/demo-api";
        let mut stored = server.object(path).unwrap();
        stored["metadata"]["annotations"]["nginx.ingress.kubernetes.io/ssl-passthrough"] = json!("false");
        server.seed(path, stored);
        Exposure::Ingress.ensure(&server.client(), &base).await.unwrap();
        assert_eq!(
            server.object(path).unwrap()["metadata"]["annotations"]["nginx.ingress.kubernetes.io/ssl-passthrough"],
            "true"
        );
    }

    #[tokio::test]
    async fn test_route_edited_out_of_band_is_restored() {
        let server = FakeApiServer::new();
        server.seed(
            "/apis/config.openshift.io/v1/ingresses/cluster",
            json!({
                "apiVersion": "config.openshift.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "cluster"},
                "spec": {"domain": "apps.example.com"}
            }),
        );
        let client = server.client();
        let base = base_metadata(&cluster("demo", "dev")).unwrap();
        Exposure::Route.ensure(&client, &base).await.unwrap();

        let path = "/apis/route.openshift.io/v1/namespaces/dev/routes/demo-api";
        let mut stored = server.object(path).unwrap();
        stored["spec"]["tls"]["termination"] = json!("edge");
        stored["spec"]["host"] = json!("api.elsewhere.example.com");
        server.seed(path, stored);

        let host = Exposure::Route.ensure(&client, &base).await.unwrap();
        assert_eq!(host.as_deref(), Some("api.demo-dev.apps.example.com"));
        assert_eq!(server.object(path).unwrap()["spec"]["tls"]["termination"], "passthrough");
        assert_eq!(server.writes().len(), 2);
    }
}
