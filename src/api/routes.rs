use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, on, patch, post, MethodFilter};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{handlers, middleware};
use crate::config::CorsOrigin;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let sync_routes = Router::new()
        .route("/pull", get(handlers::pull_changes))
        .route("/push", post(handlers::push_changes))
        .route("/vault-key", post(handlers::create_vault))
        .route("/vault-key/:vault_id", get(handlers::get_vault_key))
        .route("/vault-key/:vault_id", patch(handlers::rename_vault))
        .route("/vault/:vault_id", delete(handlers::delete_vault))
        .route("/vaults", get(handlers::list_vaults))
        .layer(from_fn_with_state(state.clone(), middleware::bearer_auth));

    // Mounted at both /storage/s3/… and /s3/…
    let storage_routes = || {
        Router::new()
            .route("/s3", get(handlers::list_objects))
            .route("/s3/:bucket", get(handlers::list_objects))
            .route(
                "/s3/:bucket/*key",
                // HEAD must reach its own handler: a GET fallback would pull
                // the whole object from the backend just to discard it.
                on(MethodFilter::GET, handlers::get_object)
                    .on(MethodFilter::HEAD, handlers::head_object)
                    .on(MethodFilter::PUT, handlers::put_object)
                    .on(MethodFilter::DELETE, handlers::delete_object),
            )
            .layer(from_fn_with_state(state.clone(), middleware::storage_auth))
    };

    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/", get(handlers::health))
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/admin/create-user", post(handlers::admin_create_user))
        .route(
            "/auth/storage-credentials",
            get(handlers::storage_credentials)
                .route_layer(from_fn_with_state(state.clone(), middleware::bearer_auth)),
        )
        .route(
            "/auth/storage-credentials/rotate",
            post(handlers::rotate_storage_credentials)
                .route_layer(from_fn_with_state(state.clone(), middleware::bearer_auth)),
        )
        .nest("/sync", sync_routes)
        .nest("/storage", storage_routes())
        .merge(storage_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &CorsOrigin) -> CorsLayer {
    match origin {
        CorsOrigin::Any => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        CorsOrigin::List(origins) => {
            let origins: Vec<HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}
