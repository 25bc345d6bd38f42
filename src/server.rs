use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::dev::Server;
use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{Config, CONFIG_VARS};
use crate::controller::LoadController;
use crate::db_check;
use crate::lifecycle::{LifecycleTimer, TerminationKind, SHUTDOWN_GRACE};
use crate::models::{DatabaseRequest, LoadResponse, SettingsRequest};
use crate::sys_info;

/// Delay before `/crash` and `/shutdown` act, so the reply gets out first.
pub const TRIGGER_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct AppState {
    pub ctrl: LoadController,
    pub lifecycle: LifecycleTimer,
    pub config: Arc<Config>,
}

#[derive(Serialize)]
struct Endpoint {
    path: &'static str,
    method: &'static str,
    body: &'static str,
    description: &'static str,
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        path: "/start",
        method: "POST",
        body: "",
        description: "Start CPU and/or memory load",
    },
    Endpoint {
        path: "/stop",
        method: "POST",
        body: "",
        description: "Stop load",
    },
    Endpoint {
        path: "/status",
        method: "GET",
        body: "",
        description: "Get current load status",
    },
    Endpoint {
        path: "/setting",
        method: "POST",
    },
    Endpoint {
        path: "/health",
        method: "GET",
        body: "",
        description: "Health check",
    },
    Endpoint {
        path: "/database",
        method: "POST",
    },
    Endpoint {
        path: "/error",
        method: "GET",
        body: "",
        description: "Simulate error for alert testing",
    },
    Endpoint {
        path: "/crash",
        method: "GET",
        body: "",
        description: "Simulate application crash for crash-loop testing",
    },
    Endpoint {
        path: "/shutdown",
        method: "GET",
        body: "",
        description: "Gracefully shutdown the server (simulate rolling update/scale down)",
    },
    Endpoint {
        path: "/load",
        method: "GET",
        body: "",
        description: "Increase CPU load by one ramp step",
    },
    Endpoint {
        path: "/load/reset",
        method: "GET",
        body: "",
        description: "Reset the CPU ramp and stop load",
    },
];

async fn overview(data: web::Data<AppState>) -> impl Responder {
    let host = match web::block(sys_info::gather_host_info).await {
        Ok(host) => Some(host),
        Err(err) => {
            warn!(error = %err, "host sampling failed");
            None
        }
    };
    let env: BTreeMap<&str, String> = CONFIG_VARS
        .iter()
        .map(|var| {
            let value = std::env::var(var)
                .unwrap_or_else(|_| "(not set, using default)".to_string());
            (*var, value)
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "status": data.ctrl.snapshot(),
        "host": host,
        "environment": env,
        "endpoints": ENDPOINTS,
    }))
}

async fn status(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.ctrl.snapshot())
}

async fn health(data: web::Data<AppState>) -> impl Responder {
    match data.ctrl.fault() {
        None => HttpResponse::Ok().json(json!({"status": "ok"})),
        Some(fault) => HttpResponse::Ok().json(json!({"status": "degraded", "fault": fault})),
    }
}

async fn simulated_error() -> impl Responder {
    let message = "Simulated database connection error for alert testing";
    error!(status_code = 500, "{message}");
    HttpResponse::InternalServerError().body(message)
}

async fn crash(data: web::Data<AppState>) -> impl Responder {
    warn!("crash requested over HTTP");
    data.lifecycle.schedule(
        TerminationKind::Crash,
        TRIGGER_DELAY,
        "simulated application crash requested via /crash".to_string(),
        None,
    );
    HttpResponse::Ok().body("Server will crash in 500ms...")
}

async fn shutdown(data: web::Data<AppState>) -> impl Responder {
    info!("graceful shutdown requested over HTTP");
    data.lifecycle.schedule(
        TerminationKind::Shutdown,
        TRIGGER_DELAY,
        "graceful shutdown requested via /shutdown".to_string(),
        None,
    );
    HttpResponse::Ok().body(
        "Server is shutting down gracefully, please restart the server \
         to continue using the service... (Exit Code: 0)",
    )
}

async fn start(data: web::Data<AppState>) -> impl Responder {
    match data.ctrl.start_configured().await {
        Ok(_) => HttpResponse::Ok().body("Load started"),
        Err(err) => {
            warn!(error = %err, "start rejected");
            HttpResponse::Conflict().body(err.to_string())
        }
    }
}

async fn stop(data: web::Data<AppState>) -> impl Responder {
    match data.ctrl.stop().await {
        Ok(()) => HttpResponse::Ok().body("Load stopped"),
        Err(err) => {
            warn!(error = %err, "stop rejected");
            HttpResponse::Conflict().body(err.to_string())
        }
    }
}

async fn setting(payload: web::Json<SettingsRequest>, data: web::Data<AppState>) -> impl Responder {
    data.ctrl.apply_settings(&payload);
    HttpResponse::Ok().body("Settings updated")
}

async fn database(
    payload: web::Json<DatabaseRequest>,
    data: web::Data<AppState>,
) -> impl Responder {
    let request = payload.into_inner();
    if let Err(response) = request.validate() {
        return HttpResponse::BadRequest().json(response);
    }
    let response =
        db_check::check_connection(&request.engine, &request.connection_string).await;
    data.ctrl.set_database_status(response.status_line());
    if response.success {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::InternalServerError().json(response)
    }
}

async fn load_increment(data: web::Data<AppState>) -> impl Responder {
    match data.ctrl.increment().await {
        Ok(step) => HttpResponse::Ok().json(LoadResponse::incremented(&step)),
        Err(err) => {
            warn!(error = %err, "ramp increment rejected");
            let ramp = data.ctrl.state().ramp;
            let body = LoadResponse::rejected(err.to_string(), &ramp);
            if err.is_conflict() {
                HttpResponse::Conflict().json(body)
            } else {
                HttpResponse::InternalServerError().json(body)
            }
        }
    }
}

async fn load_reset(data: web::Data<AppState>) -> impl Responder {
    let step = data.ctrl.reset().await;
    HttpResponse::Ok().json(LoadResponse::reset(&step))
}

fn json_body_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    warn!(error = %err, "rejected request body");
    InternalError::from_response(err, HttpResponse::BadRequest().body("Invalid JSON body")).into()
}

/// JSON extractor settings shared by every route.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(json_body_error)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(overview))
        .route("/status", web::get().to(status))
        .route("/health", web::get().to(health))
        .route("/error", web::get().to(simulated_error))
        .route("/crash", web::get().to(crash))
        .route("/shutdown", web::get().to(shutdown))
        .route("/start", web::post().to(start))
        .route("/stop", web::post().to(stop))
        .route("/setting", web::post().to(setting))
        .route("/database", web::post().to(database))
        .route("/load", web::get().to(load_increment))
        .route("/load/reset", web::get().to(load_reset));
}

/// Binds the listener. The returned server drains for at most
/// [`SHUTDOWN_GRACE`] when stopped gracefully.
pub fn build_server(state: AppState) -> std::io::Result<Server> {
    let addr = state.config.bind_addr();
    info!(
        host = %addr.0,
        port = addr.1,
        environment = %state.config.environment,
        "server starting"
    );
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(Cors::permissive())
            .app_data(web::Data::new(state.clone()))
            .app_data(json_config())
            .configure(routes)
    })
    .shutdown_timeout(SHUTDOWN_GRACE.as_secs())
    .bind(addr)?
    .run();
    Ok(server)
}
