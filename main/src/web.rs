use std::net::TcpListener;

use actix_web::{
    dev::Server, get, middleware, web, web::Data, App, HttpRequest, HttpResponse, HttpServer,
    Responder,
};
use log::error;

use metrics::{Metrics, Registry};
use utils::ControllerConfig;

#[get("/healthz")]
pub async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
pub async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
pub async fn serve_metrics(registry: Data<Registry>, _req: HttpRequest) -> impl Responder {
    match registry.encode_text() {
        Ok(body) => HttpResponse::Ok()
            .content_type(prometheus::TEXT_FORMAT)
            .body(body),
        Err(err) => {
            error!("Failed to encode metrics: {}", err);
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(ready).service(serve_metrics);
}

/// Register every metric, then build the exposition server on `listener`.
/// The returned server runs once awaited or spawned.
pub fn new_server(
    metrics: &Metrics,
    listener: TcpListener,
    config: &ControllerConfig,
) -> std::io::Result<Server> {
    metrics.register();

    let registry = metrics.registry().clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(registry.clone()))
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
            .configure(routes)
    })
    .client_request_timeout(config.read_timeout())
    .client_disconnect_timeout(config.write_timeout())
    .keep_alive(config.write_timeout())
    .shutdown_timeout(config.metrics_shutdown_timeout_seconds)
    .listen(listener)?
    .run();

    Ok(server)
}
