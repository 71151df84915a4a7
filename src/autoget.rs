//! Row claiming: hand out each unused row of a sheet exactly once.
//!
//! Requests are serialized per process through [`crate::claims::ClaimCoordinator`]. Each
//! admitted request reads columns A to C, picks the first row whose status
//! is not "used", writes "used" back and returns the row's value. When the
//! queue is already long the request bypasses it and answers from a quick
//! read-only scan instead.

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

use crate::app::{ApiError, ApiResult, AppState, SheetParams, api_error, body_error, present, upstream_error};
use crate::claims::{Admission, QueueTicket, SheetKey};
use crate::grid::{Grid, column_letter, is_used};
use crate::rotation::RotationError;

/// Data rows scanned by the queue bypass.
const SIMPLE_SCAN_ROWS: usize = 50;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Service Account not configured")]
    NotConfigured,

    #[error("sheet has no data rows ({row_count} rows read)")]
    NoData { row_count: usize },

    #[error("no unused rows left")]
    Exhausted,

    #[error("failed to reset status: {0}")]
    ResetFailed(RotationError),

    #[error(transparent)]
    Upstream(RotationError),
}

impl From<RotationError> for ClaimError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::NoCredentials => ClaimError::NotConfigured,
            other => ClaimError::Upstream(other),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutogetParams {
    pub sheet_id: Option<String>,
    pub sheet_name: Option<String>,
    pub reset: Option<String>,
}

/// GET /api/autoget: Claim the next row, or clear every status with `reset=true`
pub async fn autoget_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AutogetParams>,
) -> ApiResult {
    let (Some(sheet_id), Some(sheet_name)) =
        (present(&params.sheet_id), present(&params.sheet_name))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing parameters",
                "required": {
                    "sheetId": "Sheet ID (query param)",
                    "sheetName": "Sheet name (query param)",
                },
                "examples": [
                    "/api/autoget?sheetId=YOUR_SHEET_ID&sheetName=ACCOUNT",
                    "/api/autoget?sheetId=YOUR_SHEET_ID&sheetName=ACCOUNT&reset=true",
                ],
            }),
        ));
    };

    let reset = params.reset.as_deref() == Some("true");
    process(&state, sheet_id, sheet_name, reset).await
}

/// POST /api/autoget: Claim the next row; reset is not available here
pub async fn autoget_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SheetParams>, JsonRejection>,
) -> ApiResult {
    let Json(params) = body.map_err(body_error)?;
    let (Some(sheet_id), Some(sheet_name)) =
        (present(&params.sheet_id), present(&params.sheet_name))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Missing sheetId or sheetName" }),
        ));
    };

    process(&state, sheet_id, sheet_name, false).await
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Admit the request and run the claim under the request deadline
///
/// The queue ticket is held until this returns, so the next request
/// cannot start its read before this one has written its status.
async fn process(state: &AppState, sheet_id: &str, sheet_name: &str, reset: bool) -> ApiResult {
    let request_id = new_request_id();
    let sheet = SheetKey::new(sheet_id, sheet_name);
    log::info!("[{}] Autoget for {} (reset: {})", request_id, sheet, reset);

    let ticket = match state.claims.admit(&request_id, &sheet) {
        Admission::Admitted(ticket) => ticket,
        Admission::Busy { queue_len } => {
            log::warn!(
                "[{}] Queue busy ({} waiting), using simple mode",
                request_id,
                queue_len
            );
            return simple_mode(state, &request_id, sheet_id, sheet_name).await;
        }
    };

    let deadline = state.config.request_timeout;
    match tokio::time::timeout(deadline, claim_row(state, &ticket, &sheet, reset)).await {
        Ok(Ok(body)) => Ok(Json(body)),
        Ok(Err(err)) => Err(claim_error(state, &request_id, err)),
        Err(_) => {
            log::error!("[{}] Request timed out after {:?}", request_id, deadline);
            Err(api_error(
                StatusCode::REQUEST_TIMEOUT,
                json!({
                    "error": "Request timeout - please try again",
                    "timeout": format!("{}ms", deadline.as_millis()),
                    "queuePosition": state.claims.position(&request_id),
                }),
            ))
        }
    }
}

fn claim_error(state: &AppState, request_id: &str, err: ClaimError) -> ApiError {
    match err {
        ClaimError::NotConfigured => upstream_error(RotationError::NoCredentials),
        ClaimError::NoData { row_count } => api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": "Sheet has no data or only a header row",
                "rowCount": row_count,
            }),
        ),
        ClaimError::Exhausted => api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": true,
                "note": "No unused rows left",
            }),
        ),
        ClaimError::ResetFailed(e) => {
            log::error!("[{}] Error resetting status: {}", request_id, e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Failed to reset status",
                    "details": e.to_string(),
                }),
            )
        }
        ClaimError::Upstream(e) => {
            log::error!("[{}] Processing error: {}", request_id, e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": format!("Processing error: {}", e),
                    "queuePosition": state.claims.position(request_id),
                    "totalInQueue": state.claims.queue_len(),
                }),
            )
        }
    }
}

async fn claim_row(
    state: &AppState,
    ticket: &QueueTicket,
    sheet: &SheetKey,
    reset: bool,
) -> Result<Value, ClaimError> {
    let request_id = ticket.id();
    ticket.wait_turn().await;
    log::info!("[{}] Processing request", request_id);

    let sheet_id = sheet.sheet_id.as_str();
    let range = format!("{}!A:C", sheet.sheet_name);
    let range = range.as_str();
    let grid = state
        .rotation
        .run(|client| async move { client.get_values(sheet_id, range).await })
        .await?;

    if grid.len() <= 1 {
        return Err(ClaimError::NoData {
            row_count: grid.len(),
        });
    }

    let status_col = grid.status_column();
    if reset {
        return reset_status(state, request_id, sheet, &grid, status_col).await;
    }

    let candidates = (1..grid.len())
        .filter(|&r| !grid.cell(r, 0).is_empty() && !is_used(grid.cell(r, status_col)))
        .map(|r| (r, grid.cell(r, 0).to_string()));

    let Some((row, value)) = state.claims.claim_first(sheet, candidates) else {
        log::info!("[{}] No unused rows left in {}", request_id, sheet);
        return Err(ClaimError::Exhausted);
    };
    log::info!("[{}] Claimed row {}", request_id, row + 1);

    let cell = format!("{}!{}{}", sheet.sheet_name, column_letter(status_col), row + 1);
    let cell = cell.as_str();
    let written = state
        .rotation
        .run(|client| async move {
            client
                .update_values(sheet_id, cell, vec![vec!["used".to_string()]])
                .await
        })
        .await;
    match written {
        Ok(_) => log::info!("[{}] Marked {} as used", request_id, cell),
        Err(e) => log::error!("[{}] Failed to mark {} as used: {}", request_id, cell, e),
    }
    state.claims.remember_used(sheet, row, &value);

    let name = match value.split('|').next() {
        Some(first) if !first.is_empty() => first,
        _ => value.as_str(),
    };
    Ok(json!({
        "NAME": name,
        "VALUE": value,
    }))
}

async fn reset_status(
    state: &AppState,
    request_id: &str,
    sheet: &SheetKey,
    grid: &Grid,
    status_col: usize,
) -> Result<Value, ClaimError> {
    let letter = column_letter(status_col);
    let cleared: Vec<Vec<String>> = (1..grid.len()).map(|_| vec![String::new()]).collect();
    let reset_count = cleared.len();

    let sheet_id = sheet.sheet_id.as_str();
    let range = format!("{}!{}2:{}{}", sheet.sheet_name, letter, letter, grid.len());
    let range = range.as_str();
    state
        .rotation
        .run(|client| {
            let rows = cleared.clone();
            async move { client.update_values(sheet_id, range, rows).await }
        })
        .await
        .map_err(|e| match e {
            RotationError::NoCredentials => ClaimError::NotConfigured,
            other => ClaimError::ResetFailed(other),
        })?;

    state.claims.forget_sheet(sheet);
    log::info!("[{}] Reset {} status cells", request_id, reset_count);

    let header = grid.cell(0, status_col);
    let status_column = if header.is_empty() {
        format!("Column {}", letter)
    } else {
        header.to_string()
    };
    Ok(json!({
        "success": true,
        "message": "Reset completed",
        "resetCount": reset_count,
        "sheetName": sheet.sheet_name,
        "statusColumn": status_column,
    }))
}

/// Read-only scan used when the queue is over its threshold
///
/// Uses the first key without rotation and writes nothing, so the row it
/// reports may be handed out again.
async fn simple_mode(state: &AppState, request_id: &str, sheet_id: &str, sheet_name: &str) -> ApiResult {
    let Some(client) = state.rotation.first() else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "Auth failed" }),
        ));
    };

    let grid = match client
        .get_values(sheet_id, &format!("{}!A:C", sheet_name))
        .await
    {
        Ok(grid) => grid,
        Err(e) => {
            log::error!("[{}] Simple bypass error: {}", request_id, e);
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Simple bypass failed" }),
            ));
        }
    };
    if grid.len() <= 1 {
        return Err(api_error(StatusCode::NOT_FOUND, json!({ "error": "No data" })));
    }

    let status_col = grid.status_column();
    let free = (1..grid.len().min(SIMPLE_SCAN_ROWS)).find(|&r| !is_used(grid.cell(r, status_col)));

    match free {
        Some(row) => Ok(Json(json!({
            "column": column_letter(status_col),
            "VALUE": grid.cell(row, 0),
            "mode": "simple-bypass",
            "requestId": request_id,
        }))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": "No available rows",
                "mode": "simple-bypass",
                "requestId": request_id,
            }),
        )),
    }
}
