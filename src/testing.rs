//! Test doubles: an in-memory `SheetsApi` for the router tests and a local
//! token server for the HTTP client tests.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Form, State};
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use crate::app::{AppState, app_router};
use crate::config::Config;
use crate::credentials::ServiceAccount;
use crate::grid::Grid;
use crate::sheets::{SheetsApi, SheetsError};

/// A single sheet held in memory
///
/// Reads ignore the range and return the whole grid. Updates write the
/// first value of each row into the column named by the range start.
pub struct FakeSheet {
    label: String,
    grid: Mutex<Grid>,
    pub updates: Mutex<Vec<String>>,
    pub reads: AtomicUsize,
    failure: Option<(u16, &'static str)>,
    write_failure: Option<(u16, &'static str)>,
}

impl FakeSheet {
    fn build(
        label: &str,
        rows: &[&[&str]],
        failure: Option<(u16, &'static str)>,
        write_failure: Option<(u16, &'static str)>,
    ) -> Arc<Self> {
        Arc::new(FakeSheet {
            label: label.to_string(),
            grid: Mutex::new(Grid::new(
                rows.iter()
                    .map(|r| r.iter().map(|c| c.to_string()).collect())
                    .collect(),
            )),
            updates: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            failure,
            write_failure,
        })
    }

    pub fn new(rows: &[&[&str]]) -> Arc<Self> {
        Self::build("fake@test", rows, None, None)
    }

    /// A readable sheet whose updates fail with the given API error
    pub fn read_only(rows: &[&[&str]], status: u16, message: &'static str) -> Arc<Self> {
        Self::build("read-only@test", rows, None, Some((status, message)))
    }

    /// A sheet whose every call fails with the given API error
    pub fn failing(status: u16, message: &'static str) -> Arc<Self> {
        Self::build("failing@test", &[], Some((status, message)), None)
    }

    pub fn cell(&self, row: usize, col: usize) -> String {
        self.grid.lock().unwrap().cell(row, col).to_string()
    }

    fn fail(&self) -> Result<(), SheetsError> {
        Self::fail_with(self.failure)
    }

    fn fail_with(failure: Option<(u16, &'static str)>) -> Result<(), SheetsError> {
        match failure {
            Some((status, message)) => Err(SheetsError::Api {
                status,
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Split `C2` into zero-based (col, row)
fn parse_cell(cell: &str) -> (usize, usize) {
    let split = cell.find(|c: char| c.is_ascii_digit()).unwrap();
    let (letters, digits) = cell.split_at(split);
    let col = letters
        .bytes()
        .fold(0, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    (col - 1, digits.parse::<usize>().unwrap() - 1)
}

#[async_trait]
impl SheetsApi for FakeSheet {
    fn label(&self) -> &str {
        &self.label
    }

    async fn get_values(&self, _id: &str, _range: &str) -> Result<Grid, SheetsError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.fail()?;
        Ok(self.grid.lock().unwrap().clone())
    }

    async fn update_values(
        &self,
        _id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<u64, SheetsError> {
        Self::fail_with(self.write_failure.or(self.failure))?;
        self.updates.lock().unwrap().push(range.to_string());

        let cells = range.split('!').nth(1).unwrap();
        let (col, first_row) = parse_cell(cells.split(':').next().unwrap());
        let mut grid = self.grid.lock().unwrap();
        for (offset, values) in rows.iter().enumerate() {
            let row = &mut grid.rows[first_row + offset];
            if row.len() <= col {
                row.resize(col + 1, String::new());
            }
            row[col] = values[0].clone();
        }
        Ok(rows.len() as u64)
    }

    async fn sheet_titles(&self, _id: &str) -> Result<Vec<String>, SheetsError> {
        self.fail()?;
        Ok(vec!["WEB".to_string(), "ACCOUNT".to_string()])
    }
}

pub fn state_with(sheets: Vec<Arc<FakeSheet>>, config: Config) -> Arc<AppState> {
    Arc::new(AppState::new(
        config,
        sheets
            .into_iter()
            .map(|s| s as Arc<dyn SheetsApi>)
            .collect(),
    ))
}

pub fn router_with(sheet: Arc<FakeSheet>) -> Router {
    app_router(state_with(vec![sheet], Config::default()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 256 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

pub async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

/// PKCS#8 RSA key used to sign assertions in tests
pub const PKCS8_KEY: &str = include_str!("testdata/pkcs8_key.pem");

/// The same key in PKCS#1 form
pub const PKCS1_KEY: &str = include_str!("testdata/pkcs1_key.pem");

pub fn fixture_account(token_uri: &str) -> ServiceAccount {
    ServiceAccount {
        client_email: "svc@project.iam.gserviceaccount.com".to_string(),
        private_key: PKCS8_KEY.to_string(),
        token_uri: token_uri.to_string(),
        project_id: Some("project".to_string()),
        private_key_id: None,
    }
}

/// Serve `app` on an ephemeral local port and return its base URL
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

/// Token endpoint that issues `token-1`, `token-2`, ... for valid assertions
pub struct TokenEndpoint {
    pub exchanges: AtomicUsize,
    expires_in: i64,
}

impl TokenEndpoint {
    pub fn new(expires_in: i64) -> Arc<Self> {
        Arc::new(TokenEndpoint {
            exchanges: AtomicUsize::new(0),
            expires_in,
        })
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Router answering `POST /token`
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/token", post(issue_token))
            .with_state(Arc::clone(self))
    }
}

async fn issue_token(
    State(endpoint): State<Arc<TokenEndpoint>>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let well_formed = form.get("grant_type").map(String::as_str)
        == Some("urn:ietf:params:oauth:grant-type:jwt-bearer")
        && form
            .get("assertion")
            .is_some_and(|a| a.split('.').count() == 3);
    if !well_formed {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        );
    }

    let n = endpoint.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({
            "access_token": format!("token-{}", n),
            "expires_in": endpoint.expires_in,
            "token_type": "Bearer",
        })),
    )
}
