use axum::{
    Json, Router,
    extract::{Query, Request, State, rejection::JsonRejection},
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::autoget;
use crate::claims::ClaimCoordinator;
use crate::config::Config;
use crate::credentials::load_service_accounts;
use crate::lookup;
use crate::rotation::{KeyRotation, RotationError};
use crate::sheets::{SheetsApi, SheetsClient};

/// Outbound request timeout for the Sheets and token endpoints.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Error half of every JSON handler: a status and a JSON body
pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Shared state behind every handler
pub struct AppState {
    pub config: Config,
    pub rotation: KeyRotation,
    pub claims: Arc<ClaimCoordinator>,
}

impl AppState {
    /// Build state over an explicit set of spreadsheet clients
    ///
    /// # Arguments
    /// * `config` - Process configuration
    /// * `clients` - One client per service-account key, in rotation order
    pub fn new(config: Config, clients: Vec<Arc<dyn SheetsApi>>) -> Self {
        let rotation = KeyRotation::new(clients, config.key_cooldown);
        let claims = ClaimCoordinator::new(config.queue_busy_threshold, config.row_claim_timeout);
        AppState {
            config,
            rotation,
            claims,
        }
    }

    /// Build state with one Google Sheets client per configured key
    ///
    /// # Errors
    /// * Returns an error if the HTTP client cannot be constructed
    pub fn from_config(config: Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        let clients: Vec<Arc<dyn SheetsApi>> = load_service_accounts(&config.service_account_keys)
            .into_iter()
            .map(|account| {
                Arc::new(SheetsClient::new(account, http.clone(), &config.sheets_api_base))
                    as Arc<dyn SheetsApi>
            })
            .collect();

        if clients.is_empty() {
            log::warn!("No Service Account keys found; spreadsheet endpoints will fail");
        }

        Ok(AppState::new(config, clients))
    }
}

/// Build an `ApiError` from a status and JSON body
pub fn api_error(status: StatusCode, body: Value) -> ApiError {
    (status, Json(body))
}

/// Map a failed upstream call to a response
///
/// Missing credentials get their own message so operators can tell a
/// configuration problem from a Sheets outage.
pub fn upstream_error(err: RotationError) -> ApiError {
    match err {
        RotationError::NoCredentials => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": "Service Account not configured",
                "details": "No GOOGLE_SERVICE_ACCOUNT_KEY environment variables found",
                "availableKeys": 0,
            }),
        ),
        other => {
            log::error!("Upstream error: {}", other);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Internal server error",
                    "details": other.to_string(),
                }),
            )
        }
    }
}

/// Turn a malformed JSON body into the same shape as other errors
pub fn body_error(rejection: JsonRejection) -> ApiError {
    api_error(
        StatusCode::BAD_REQUEST,
        json!({
            "error": "Invalid JSON body",
            "details": rejection.body_text(),
        }),
    )
}

/// Treat empty strings like absent parameters
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Build the router with all routes
///
/// # Arguments
/// * `state` - Shared application state
///
/// # Returns
/// * `Router` - The application, with CORS and request logging applied
pub fn app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ]);

    Router::new()
        .route("/", get(serve_form))
        .route("/health", get(health))
        .route(
            "/api/search",
            get(lookup::search_get)
                .post(lookup::search_post)
                .options(preflight),
        )
        .route(
            "/api/getrow",
            get(lookup::getrow_get)
                .post(lookup::getrow_post)
                .options(preflight),
        )
        .route(
            "/api/sheets",
            get(lookup::sheets_get)
                .post(lookup::sheets_post)
                .options(preflight),
        )
        .route(
            "/api/sheets/:sheet_id",
            get(lookup::sheet_cell).options(preflight),
        )
        .route(
            "/api/autoget",
            get(autoget::autoget_get)
                .post(autoget::autoget_post)
                .options(preflight),
        )
        .route("/api/debug", get(debug_sheet))
        .route("/api/test-sheets", get(test_sheets))
        .route("/api/test", get(test_get).post(test_post))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(log_requests))
                .layer(cors),
        )
        .with_state(state)
}

/// Start the HTTP server and run until Ctrl-C
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr = config.bind_addr();
    let state = Arc::new(AppState::from_config(config)?);
    let app = app_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    log::info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn serve_form() -> Html<&'static str> {
    Html(include_str!("./static/index.html"))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "keys": state.rotation.len(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetParams {
    pub sheet_id: Option<String>,
    pub sheet_name: Option<String>,
}

/// GET /api/debug: Dump the top-left corner of a sheet and the key state
async fn debug_sheet(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SheetParams>,
) -> ApiResult {
    let (Some(sheet_id), Some(sheet_name)) = (present(&params.sheet_id), present(&params.sheet_name))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["sheetId", "sheetName"],
                "example": "/api/debug?sheetId=SHEET_ID&sheetName=API_MAY",
            }),
        ));
    };

    let range = format!("{}!A1:Z10", sheet_name);
    let range = range.as_str();
    let grid = state
        .rotation
        .run(|client| async move { client.get_values(sheet_id, range).await })
        .await
        .map_err(upstream_error)?;

    let first_rows: Vec<&Vec<String>> = grid.rows.iter().take(5).collect();

    Ok(Json(json!({
        "sheetId": sheet_id,
        "sheetName": sheet_name,
        "totalRows": grid.len(),
        "headers": grid.headers(),
        "firstFewRows": first_rows,
        "columnAValues": grid.row_keys(9),
        "rotation": state.rotation.snapshot(),
        "queue": {
            "size": state.claims.queue_len(),
            "processingRows": state.claims.processing_len(),
        },
    })))
}

/// GET /api/test-sheets: List the tabs of a spreadsheet
async fn test_sheets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SheetParams>,
) -> ApiResult {
    let Some(sheet_id) = present(&params.sheet_id) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["sheetId"],
                "optional": ["sheetName"],
            }),
        ));
    };

    let titles = state
        .rotation
        .run(|client| async move { client.sheet_titles(sheet_id).await })
        .await
        .map_err(upstream_error)?;

    let searched = present(&params.sheet_name);
    let exists = searched.map(|name| titles.iter().any(|t| t == name));

    Ok(Json(json!({
        "sheetId": sheet_id,
        "availableSheets": titles,
        "totalSheets": titles.len(),
        "searchedFor": searched,
        "exists": exists,
    })))
}

async fn test_get() -> Json<Value> {
    Json(json!({ "message": "API is working!" }))
}

/// POST /api/test: Report which credentials are configured
///
/// Only blob sizes and masked client emails are reported, never key material.
async fn test_post(State(state): State<Arc<AppState>>) -> Json<Value> {
    let keys: Vec<Value> = state
        .rotation
        .snapshot()
        .keys
        .into_iter()
        .map(|key| {
            json!({
                "index": key.index,
                "clientEmail": mask_email(&key.label),
                "failures": key.failures,
            })
        })
        .collect();
    let blob_lengths: Vec<usize> = state
        .config
        .service_account_keys
        .iter()
        .map(String::len)
        .collect();

    Json(json!({
        "success": true,
        "serviceAccounts": {
            "configured": blob_lengths.len(),
            "loaded": state.rotation.len(),
            "blobLengths": blob_lengths,
            "keys": keys,
        },
    }))
}

/// Keep the first three characters of the local part and the domain
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let shown: String = local.chars().take(3).collect();
            format!("{}***@{}", shown, domain)
        }
        None => "***".to_string(),
    }
}
