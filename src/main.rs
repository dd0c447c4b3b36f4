use actix_web::{web, App, HttpServer};
use devicegate::auth::handlers;
use devicegate::{Admission, AppError, AppState, Settings};
use std::net::TcpListener;
use tracing::{error, info};

#[actix_web::main]
async fn main() -> devicegate::Result<()> {
    devicegate::telemetry::init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    // Initialize application state
    let state = AppState::new(config.clone()).await?;
    state.start_background();

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    let app_state = web::Data::new(state.clone());
    let gate = state.gate.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(Admission::new(gate.clone()))
            .app_data(app_state.clone())
            .configure(handlers::configure)
    })
    .listen(listener)
    .map_err(|e| AppError::InternalError(e.to_string()))?
    .workers(config.server.workers as usize)
    .run()
    .await;

    if let Err(e) = &result {
        error!(error = %e, "server exited with error");
    }
    state.shutdown().await?;
    result.map_err(|e| AppError::InternalError(e.to_string()))
}
