mod api;
mod auth;
mod config;
mod models;
mod ratelimit;
mod store;
mod sync;

use actix_cors::Cors;
use actix_web::{http, middleware, web, App, HttpServer};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use api::AppState;
use auth::AuthService;
use ratelimit::RateLimiter;
use store::Store;
use sync::SyncEngine;

// Credential endpoints: 20 requests per minute per client address.
const AUTH_RATE_LIMIT: u32 = 20;
const AUTH_RATE_PERIOD: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("load config: {}", e);
            process::exit(1);
        }
    };

    let store = match Store::new(&cfg.database.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("open database {}: {}", cfg.database.path, e);
            process::exit(1);
        }
    };
    log::info!("database opened at {}", cfg.database.path);

    let (access_expiry, refresh_expiry) = match (cfg.auth.access_expiry(), cfg.auth.refresh_expiry()) {
        (Ok(a), Ok(r)) => (a, r),
        (Err(e), _) | (_, Err(e)) => {
            log::error!("token expiry config: {}", e);
            process::exit(1);
        }
    };

    let auth_service = match AuthService::from_key_file(&cfg.auth.private_key, access_expiry, refresh_expiry) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            log::error!("load signing key {}: {}", cfg.auth.private_key, e);
            process::exit(1);
        }
    };

    let auth_limiter = Arc::new(RateLimiter::new(AUTH_RATE_LIMIT, AUTH_RATE_PERIOD));

    // Periodic sweep: expired rate-limit windows and refresh tokens.
    {
        let limiter = auth_limiter.clone();
        let store = store.clone();
        thread::spawn(move || loop {
            thread::sleep(SWEEP_INTERVAL);
            limiter.sweep();
            match store.delete_expired_refresh_tokens() {
                Ok(purged) if purged > 0 => {
                    log::info!("purged {} expired refresh tokens", purged);
                }
                Ok(_) => {}
                Err(e) => log::warn!("refresh token sweep: {}", e),
            }
        });
    }

    let state = web::Data::new(AppState {
        store: store.clone(),
        auth: auth_service.clone(),
        sync: SyncEngine::new(store),
        auth_limiter,
        started_at: Instant::now(),
    });
    let auth_data = web::Data::new(auth_service);

    let listen = cfg.server.listen.clone();
    log::info!("server starting on {}", listen);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![http::header::CONTENT_TYPE, http::header::AUTHORIZATION]);

        // CatchPanic is registered first so it wraps the handlers
        // directly and the logger still records the resulting 500.
        App::new()
            .wrap(api::CatchPanic)
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .app_data(auth_data.clone())
            .app_data(api::json_config())
            .configure(api::configure_routes)
    })
    // Read and idle deadlines. The builder has no per-response write
    // timeout counterpart; see DESIGN.md.
    .client_request_timeout(Duration::from_secs(10))
    .keep_alive(Duration::from_secs(60))
    .shutdown_timeout(5);

    let server = match server.bind(&listen) {
        Ok(server) => server,
        Err(e) => {
            log::error!("listen on {}: {}", listen, e);
            process::exit(1);
        }
    };

    server.run().await
}
