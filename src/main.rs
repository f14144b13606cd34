use actix_web::{
    get, middleware, post,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

pub use hopper::*;

use crate::helpers::manager::Manager;
use crate::lifecycle::CreateServerRequest;
use crate::objects::user::User;

const CALLER_HEADER: &str = "x-hopper-user";

async fn caller(m: &Manager, req: &HttpRequest) -> Result<User> {
    let header = req
        .headers()
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok());
    m.caller(header).await
}

#[post("/server/create")]
async fn create_server(
    m: Data<Manager>,
    req: HttpRequest,
    body: web::Json<CreateServerRequest>,
) -> Result<HttpResponse> {
    let user = caller(&m, &req).await?;
    let created = m
        .lifecycle
        .create(&user, body.into_inner(), m.env_id())
        .await?;
    Ok(HttpResponse::Ok().json(created))
}

#[derive(Deserialize)]
struct DeleteBody {
    unique_id: String,
}

#[post("/server/delete")]
async fn delete_server(
    m: Data<Manager>,
    req: HttpRequest,
    body: web::Json<DeleteBody>,
) -> Result<HttpResponse> {
    let user = caller(&m, &req).await?;
    let report = m
        .lifecycle
        .delete(&user, &body.unique_id, m.env_id())
        .await?;
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Deserialize)]
struct AvailabilityQuery {
    #[serde(default)]
    rcon: bool,
}

#[get("/server/check-availability")]
async fn check_availability(
    m: Data<Manager>,
    req: HttpRequest,
    query: web::Query<AvailabilityQuery>,
) -> Result<HttpResponse> {
    let user = caller(&m, &req).await?;
    let availability = m
        .lifecycle
        .check_availability(&user, query.rcon, m.env_id())
        .await?;
    Ok(HttpResponse::Ok().json(availability))
}

#[derive(Deserialize)]
struct SubdomainBody {
    subdomain: String,
}

#[post("/server/check-subdomain")]
async fn check_subdomain(
    m: Data<Manager>,
    req: HttpRequest,
    body: web::Json<SubdomainBody>,
) -> Result<HttpResponse> {
    let user = caller(&m, &req).await?;
    let check = m.lifecycle.check_subdomain(&user, &body.subdomain).await?;
    Ok(HttpResponse::Ok().json(check))
}

#[post("/admin/reconcile")]
async fn admin_reconcile(m: Data<Manager>, req: HttpRequest) -> Result<HttpResponse> {
    let user = caller(&m, &req).await?;
    if !user.is_admin {
        return Err(Error::Authorization("reconcile requires admin".into()));
    }
    let fleet = m.fleet.ensure_fleet(m.env_id()).await?;
    let sync = m.fleet.sync_servers(m.env_id()).await?;
    Ok(HttpResponse::Ok().json(json!({ "fleet": fleet, "sync": sync })))
}

#[get("/metrics")]
async fn metrics(m: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = m.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&metrics, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/state")]
async fn state(m: Data<Manager>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "state": m.state(),
        "proxies": m.fleet.health(),
    }))
}

#[actix_rt::main]
async fn main() -> Result<()> {
    let logger = tracing_subscriber::fmt::layer().json();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default env filter");
    let collector = Registry::default().with(logger).with(env_filter);
    tracing::subscriber::set_global_default(collector).expect("set tracing subscriber");

    let (manager, fleet_drainer) = Manager::new().await?;
    let bind_addr = manager.settings.bind_addr.clone();
    info!(%bind_addr, "hopper operator starting");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(create_server)
            .service(delete_server)
            .service(check_availability)
            .service(check_subdomain)
            .service(admin_reconcile)
            .service(state)
            .service(health)
            .service(metrics)
    })
    .bind(&bind_addr)
    .unwrap_or_else(|_| panic!("can't bind to {bind_addr}"))
    .shutdown_timeout(0);

    tokio::select! {
        _ = fleet_drainer => warn!("fleet reconciler exited"),
        _ = server.run() => info!("actix exited"),
    }
    Ok(())
}
