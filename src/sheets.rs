use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::TokenSource;
use crate::credentials::{CredentialError, ServiceAccount};
use crate::grid::Grid;

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sheets API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl SheetsError {
    /// Build an API error from a non-2xx response body
    ///
    /// Google wraps errors as `{"error": {"code", "message", "status", "errors"}}`;
    /// the status and any `reason` codes are folded into the message so that
    /// quota detection can see them. Bodies in other shapes are kept verbatim.
    pub fn from_error_body(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let mut message = envelope.error.message;
                if let Some(code) = envelope.error.status {
                    message.push_str(&format!(" [{}]", code));
                }
                for detail in envelope.error.errors {
                    if !detail.reason.is_empty() {
                        message.push_str(&format!(" ({})", detail.reason));
                    }
                }
                message
            }
            Err(_) => body.trim().to_string(),
        };
        SheetsError::Api { status, message }
    }

    /// Whether the failure was a per-key quota limit
    ///
    /// Quota failures are the only ones that warrant switching to another key.
    pub fn is_quota(&self) -> bool {
        match self {
            SheetsError::Api { status, message } => {
                let lower = message.to_lowercase();
                *status == 429
                    || message.contains("Quota exceeded")
                    || message.contains("quota metric")
                    || message.contains("Read requests per minute")
                    || lower.contains("quota exceeded")
                    || lower.contains("quotaexceeded")
            }
            _ => false,
        }
    }

    /// Whether the failure means the requested sheet or range does not exist
    pub fn is_missing_range(&self) -> bool {
        match self {
            SheetsError::Api { message, .. } => {
                message.contains("Unable to parse range")
                    || message.contains("not found")
                    || message.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// The spreadsheet operations the endpoints rely on
///
/// One implementation talks to Google with a single credential; tests
/// substitute an in-memory sheet.
#[async_trait]
pub trait SheetsApi: Send + Sync {
    /// Human-readable identity of the credential, for logs
    fn label(&self) -> &str;

    /// `spreadsheets.values.get`
    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Grid, SheetsError>;

    /// `spreadsheets.values.update` with `valueInputOption=RAW`
    ///
    /// # Returns
    /// * `Result<u64, SheetsError>` - Number of cells the API reports as updated
    async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<u64, SheetsError>;

    /// Titles of every sheet (tab) in the spreadsheet
    async fn sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>, SheetsError>;
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    #[serde(default)]
    updated_cells: u64,
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Deserialize)]
struct SheetProperties {
    #[serde(default)]
    title: String,
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Sheets v4 REST client bound to one service account
pub struct SheetsClient {
    http: reqwest::Client,
    tokens: TokenSource,
    base_url: String,
}

impl SheetsClient {
    pub fn new(account: ServiceAccount, http: reqwest::Client, base_url: &str) -> Self {
        SheetsClient {
            tokens: TokenSource::new(account, http.clone()),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(range)
        )
    }

    async fn read_json<T>(response: reqwest::Response) -> Result<T, SheetsError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SheetsError::from_error_body(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| SheetsError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SheetsApi for SheetsClient {
    fn label(&self) -> &str {
        self.tokens.client_email()
    }

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Grid, SheetsError> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(self.values_url(spreadsheet_id, range))
            .bearer_auth(token)
            .send()
            .await?;

        let range: ValueRange = Self::read_json(response).await?;
        Ok(Grid::new(
            range
                .values
                .into_iter()
                .map(|row| row.into_iter().map(cell_text).collect())
                .collect(),
        ))
    }

    async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<u64, SheetsError> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .put(self.values_url(spreadsheet_id, range))
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(token)
            .json(&serde_json::json!({ "range": range, "values": rows }))
            .send()
            .await?;

        let update: UpdateValuesResponse = Self::read_json(response).await?;
        Ok(update.updated_cells)
    }

    async fn sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>, SheetsError> {
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(format!(
                "{}/spreadsheets/{}",
                self.base_url,
                urlencoding::encode(spreadsheet_id)
            ))
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(token)
            .send()
            .await?;

        let meta: SpreadsheetMeta = Self::read_json(response).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| s.properties.title)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_envelope_is_detected() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded for quota metric 'Read requests' and limit 'Read requests per minute per user'","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = SheetsError::from_error_body(429, body);
        assert!(err.is_quota());
        assert!(!err.is_missing_range());
    }

    #[test]
    fn quota_reason_code_is_detected_without_429() {
        let body = r#"{"error":{"code":403,"message":"Limit hit","errors":[{"reason":"quotaExceeded"}]}}"#;
        assert!(SheetsError::from_error_body(403, body).is_quota());
    }

    #[test]
    fn permission_error_is_not_quota() {
        let body = r#"{"error":{"code":403,"message":"The caller does not have permission","status":"PERMISSION_DENIED"}}"#;
        let err = SheetsError::from_error_body(403, body);
        assert!(!err.is_quota());
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }

    #[test]
    fn bad_range_is_missing() {
        let body = r#"{"error":{"code":400,"message":"Unable to parse range: NOPE","status":"INVALID_ARGUMENT"}}"#;
        assert!(SheetsError::from_error_body(400, body).is_missing_range());
    }

    #[test]
    fn non_json_body_is_kept() {
        let err = SheetsError::from_error_body(502, "  Bad Gateway ");
        match err {
            SheetsError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Bad Gateway");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_string_cells_are_rendered() {
        assert_eq!(cell_text(serde_json::json!(42)), "42");
        assert_eq!(cell_text(serde_json::json!(true)), "true");
        assert_eq!(cell_text(Value::Null), "");
        assert_eq!(cell_text(serde_json::json!("x")), "x");
    }

    #[test]
    fn ranges_are_percent_encoded() {
        let account = ServiceAccount::try_from_str(r#"{"client_email":"a@b","private_key":"k\nk"}"#)
            .unwrap();
        let client = SheetsClient::new(account, reqwest::Client::new(), "http://api/v4/");
        assert_eq!(
            client.values_url("abc", "My Sheet!A:C"),
            "http://api/v4/spreadsheets/abc/values/My%20Sheet%21A%3AC"
        );
    }

    /// A request as the local Sheets server saw it
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        query: Option<String>,
        authorization: String,
        body: Value,
    }

    #[derive(Default)]
    struct Recorder {
        seen: std::sync::Mutex<Vec<Seen>>,
    }

    async fn fake_sheets_api(
        axum::extract::State(recorder): axum::extract::State<std::sync::Arc<Recorder>>,
        request: axum::extract::Request,
    ) -> (axum::http::StatusCode, axum::Json<Value>) {
        use axum::http::StatusCode;
        use serde_json::json;

        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let query = request.uri().query().map(str::to_string);
        let authorization = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = axum::body::to_bytes(request.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        recorder.seen.lock().unwrap().push(Seen {
            method: method.clone(),
            path: path.clone(),
            query,
            authorization,
            body,
        });

        let reply = match (method.as_str(), path.as_str()) {
            ("GET", "/v4/spreadsheets/s1/values/WEB%21A%3AB") => (
                StatusCode::OK,
                json!({ "range": "WEB!A1:B2", "values": [["name", "count"], ["alice", 2]] }),
            ),
            ("PUT", "/v4/spreadsheets/s1/values/ACCOUNT%21C3") => {
                (StatusCode::OK, json!({ "updatedRange": "ACCOUNT!C3", "updatedCells": 1 }))
            }
            ("GET", "/v4/spreadsheets/s1") => (
                StatusCode::OK,
                json!({ "sheets": [{ "properties": { "title": "WEB" } }, { "properties": { "title": "ACCOUNT" } }] }),
            ),
            _ => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": {
                    "code": 429,
                    "message": "Quota exceeded for quota metric 'Read requests'",
                    "status": "RESOURCE_EXHAUSTED"
                } }),
            ),
        };
        (reply.0, axum::Json(reply.1))
    }

    #[tokio::test]
    async fn client_requests_carry_bearer_token_and_raw_input_option() {
        let tokens = crate::testing::TokenEndpoint::new(3600);
        let recorder = std::sync::Arc::new(Recorder::default());
        let app = tokens.router().merge(
            axum::Router::new()
                .fallback(fake_sheets_api)
                .with_state(recorder.clone()),
        );
        let base = crate::testing::serve(app).await;
        let client = SheetsClient::new(
            crate::testing::fixture_account(&format!("{}/token", base)),
            reqwest::Client::new(),
            &format!("{}/v4", base),
        );

        let grid = client.get_values("s1", "WEB!A:B").await.unwrap();
        assert_eq!(grid.cell(1, 0), "alice");
        assert_eq!(grid.cell(1, 1), "2");

        let updated = client
            .update_values("s1", "ACCOUNT!C3", vec![vec!["used".to_string()]])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        assert_eq!(client.sheet_titles("s1").await.unwrap(), vec!["WEB", "ACCOUNT"]);

        let err = client.get_values("s1", "OTHER!A:A").await.unwrap_err();
        assert!(err.is_quota());
        assert!(err.to_string().contains("RESOURCE_EXHAUSTED"));

        // Four API calls on one cached token
        assert_eq!(tokens.exchanges(), 1);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|r| r.authorization == "Bearer token-1"));

        let put = seen.iter().find(|r| r.method == "PUT").unwrap();
        assert_eq!(put.path, "/v4/spreadsheets/s1/values/ACCOUNT%21C3");
        assert_eq!(put.query.as_deref(), Some("valueInputOption=RAW"));
        assert_eq!(put.body["range"], "ACCOUNT!C3");
        assert_eq!(put.body["values"], serde_json::json!([["used"]]));

        let titles = seen
            .iter()
            .find(|r| r.path == "/v4/spreadsheets/s1")
            .unwrap();
        assert_eq!(titles.query.as_deref(), Some("fields=sheets.properties.title"));
    }
}
