use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};

pub use crc_operator::{self, controllers, telemetry, Metrics, OperatorConfig, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// CrcBundle booted by clusters that do not name one
    #[arg(long = "default-bundle-name", env = "DEFAULT_BUNDLE_NAME")]
    default_bundle_name: String,

    /// Image of the route helper deployed next to every ready cluster
    #[arg(long = "routes-helper-image", env = "ROUTES_HELPER_IMAGE")]
    routes_helper_image: String,

    /// Namespace holding the CrcBundles, normally the operator's own
    #[arg(long = "bundle-namespace", env = "POD_NAMESPACE", value_name = "NAMESPACE")]
    bundle_namespace: String,

    #[arg(long = "concurrency", env = "CONCURRENCY", default_value_t = 10)]
    concurrency: u16,
}

impl From<Arguments> for OperatorConfig {
    fn from(args: Arguments) -> Self {
        OperatorConfig {
            default_bundle_name: args.default_bundle_name,
            routes_helper_image: args.routes_helper_image,
            bundle_namespace: args.bundle_namespace,
            concurrency: args.concurrency,
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args: Arguments = Arguments::parse();

    // Initialize Kubernetes controller state
    let state = State::new(args.into());
    let client = Client::try_default().await?;
    let operator_metrics = Metrics::default().register(&state.registry)?;

    let controller = controllers::crccluster::run(client, operator_metrics, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
