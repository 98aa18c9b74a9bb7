use std::{path::Path, sync::Arc};

use archiver::ArchiveConfig;
use axum::{
    extract::{MatchedPath, Query, Request, State},
    http::Method,
    routing::get,
    Json,
    Router,
};
use blob_store::BlobStore;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::http_objects::{ApiError, ListParams, ObjectInfo};

pub(crate) mod objects;
use objects::get_object;

#[derive(OpenApi)]
#[openapi(
        paths(
            list_objects,
            objects::get_object,
        ),
        components(
            schemas(
                ApiError,
                ObjectInfo,
            )
        ),
        tags(
            (name = "bucket-browser", description = "Blob store browsing API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub blob_store: Arc<dyn BlobStore>,
    pub archive: ArchiveConfig,
}

pub fn create_routes(route_state: RouteState, static_dir: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/docs/openapi.json", get(openapi))
        .route(
            "/",
            get(list_objects)
                .post(not_implemented)
                .delete(not_implemented)
                .with_state(route_state.clone()),
        )
        .route("/objects", get(get_object).with_state(route_state.clone()));

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// List the direct children of a folder
#[utoipa::path(
    get,
    path = "/",
    tag = "browse",
    params(ListParams),
    responses(
        (status = 200, description = "Objects and folders directly below the prefix", body = [ObjectInfo]),
        (status = BAD_REQUEST, description = "Empty prefix"),
        (status = INTERNAL_SERVER_ERROR, description = "Unable to list the prefix")
    ),
)]
#[tracing::instrument(skip(state))]
pub async fn list_objects(
    State(state): State<RouteState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ObjectInfo>>, ApiError> {
    let prefix = match params.prefix.as_deref() {
        None => "",
        Some("") => return Err(ApiError::bad_request("prefix must not be empty")),
        Some(prefix) => prefix,
    };
    let entries = state.blob_store.list_objects(prefix).await?;
    Ok(Json(
        entries
            .into_iter()
            // a folder marker is not its own child
            .filter(|entry| entry.key != prefix)
            .map(ObjectInfo::from)
            .collect(),
    ))
}

async fn not_implemented() -> ApiError {
    ApiError::not_implemented()
}
