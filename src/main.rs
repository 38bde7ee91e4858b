use std::{net::SocketAddr, sync::Arc};

use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod model;
mod report;
mod routes;
mod storage;
mod utils;

use config::Config;
use model::{LazyModel, ModelLoader};
use routes::AppState;
use utils::ensure_model_exists;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    storage::ensure_directories(&[&config.upload_dir, &config.results_dir, &config.reports_dir])?;
    ensure_model_exists(&config.model_path, config.model_url.as_deref()).await?;

    let model = Arc::new(LazyModel::new(model_loader(&config)));
    if config.preload_model {
        model.get().await?;
    }
    tracing::info!(
        path = %config.model_path.display(),
        classes = config.class_names.len(),
        preloaded = model.is_loaded(),
        "model configured"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = routes::router(AppState {
        config: Arc::new(config),
        model,
    });

    tracing::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tensorflow")]
fn model_loader(config: &Config) -> ModelLoader {
    let path = config.model_path.clone();
    let input_operation = config.input_operation.clone();
    let output_operation = config.output_operation.clone();
    Arc::new(move || -> Result<Arc<dyn model::Classifier>, model::InferenceError> {
        let model = model::Model::new(&path, &input_operation, &output_operation)?;
        Ok(Arc::new(model))
    })
}

#[cfg(not(feature = "tensorflow"))]
fn model_loader(config: &Config) -> ModelLoader {
    let path = config.model_path.display().to_string();
    Arc::new(move || -> Result<Arc<dyn model::Classifier>, model::InferenceError> {
        Err(model::InferenceError::Load {
            path: path.clone(),
            message: "built without the `tensorflow` feature".to_string(),
        })
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
