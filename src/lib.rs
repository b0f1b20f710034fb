pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::config::AppConfig;
use crate::services::content::{
    FactoryRegistry, ItemUid, RepositoryContainerResolver, RepositoryWorkflow,
};
use crate::services::dispatcher::UploadDispatcher;
use crate::services::session_store::UploadSessionStore;
use crate::services::storage::StorageService;
use crate::services::tus::TusAdapter;
use axum::{
    Router,
    routing::{any, get},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload,
        api::handlers::upload::upload_chunk,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            services::dispatcher::UploadResult,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "upload", description = "One-shot and resumable (tus) uploads"),
        (name = "system", description = "Service health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub sessions: Arc<UploadSessionStore>,
    pub dispatcher: Arc<UploadDispatcher>,
    pub config: AppConfig,
}

impl AppState {
    /// Wires the session store, protocol adapter and content collaborators.
    /// The resumable adapter only exists when `config.upload.enabled`.
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, config: AppConfig) -> Self {
        let sessions = Arc::new(UploadSessionStore::new(&config.upload));
        let tus = config
            .upload
            .enabled
            .then(|| TusAdapter::new(sessions.clone(), &config.upload));

        let resolver = Arc::new(RepositoryContainerResolver::new(
            db.clone(),
            Arc::new(RepositoryWorkflow::new(db.clone())),
            config.images_folder.clone(),
        ));
        let factories = FactoryRegistry::new(db.clone(), storage, &config);
        let dispatcher = Arc::new(UploadDispatcher::new(
            db.clone(),
            &config,
            tus,
            resolver,
            factories,
            Arc::new(ItemUid),
        ));

        Self {
            db,
            sessions,
            dispatcher,
            config,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/containers/:container_id/upload",
            any(api::handlers::upload::upload),
        )
        .route(
            "/containers/:container_id/upload/:upload_id",
            any(api::handlers::upload::upload_chunk),
        )
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_file_size + 10 * 1024 * 1024, // Add 10MB buffer for multipart overhead
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .with_state(state)
}
