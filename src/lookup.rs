//! Read-only lookups: coordinate search, column dump and the legacy
//! multiplexed `/api/sheets` endpoints.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::app::{ApiError, ApiResult, AppState, api_error, body_error, present, upstream_error};
use crate::grid::{Grid, SearchMiss, column_letter};
use crate::rotation::RotationError;

/// Range wide enough to cover every column a real sheet uses.
const FULL_WIDTH: &str = "A:ZZZ";

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn fetch(state: &AppState, sheet_id: &str, range: &str) -> Result<Grid, ApiError> {
    state
        .rotation
        .run(|client| async move { client.get_values(sheet_id, range).await })
        .await
        .map_err(upstream_error)
}

fn no_data() -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        json!({ "error": "No data found in sheet" }),
    )
}

// ---------------------------------------------------------------------------
// /api/search
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub sheet_id: Option<String>,
    pub sheet_name: Option<String>,
    pub row_value: Option<String>,
    pub column_value: Option<String>,
}

/// GET /api/search: Value at the intersection of a row key and a column header
pub async fn search_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult {
    if present(&params.sheet_id).is_none() || present(&params.sheet_name).is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": {
                    "sheetId": "Sheet ID (query param)",
                    "sheetName": "Sheet name (query param)",
                    "rowValue": "Row value to search (query param)",
                    "columnValue": "Column value to search (query param)",
                },
                "example": "/api/search?sheetId=SHEET_ID&sheetName=WEB&rowValue=FUN_OTP&columnValue=May1",
            }),
        ));
    }
    search(&state, &params).await
}

/// POST /api/search: Same as GET with a JSON body
pub async fn search_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchParams>, JsonRejection>,
) -> ApiResult {
    let Json(params) = body.map_err(body_error)?;
    if present(&params.sheet_id).is_none() || present(&params.sheet_name).is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["sheetId", "sheetName", "rowValue", "columnValue"],
            }),
        ));
    }
    search(&state, &params).await
}

async fn search(state: &AppState, params: &SearchParams) -> ApiResult {
    let sheet_id = present(&params.sheet_id).unwrap_or_default();
    let sheet_name = present(&params.sheet_name).unwrap_or_default();

    let (Some(row_value), Some(column_value)) =
        (present(&params.row_value), present(&params.column_value))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing search parameters",
                "required": ["rowValue", "columnValue"],
                "description": "Both rowValue and columnValue are required for search",
            }),
        ));
    };

    let grid = fetch(state, sheet_id, &format!("{}!{}", sheet_name, FULL_WIDTH)).await?;
    if grid.is_empty() {
        return Err(no_data());
    }

    match grid.search(row_value, column_value) {
        Ok(hit) => Ok(Json(json!({
            "success": true,
            "coordinate": hit.coordinate(),
            "value": hit.value,
            "rowHeader": hit.row_header,
            "columnHeader": hit.column_header,
            "rowNumber": hit.row + 1,
            "columnLetter": column_letter(hit.col),
            "sheetName": sheet_name,
        }))),
        Err(SearchMiss::Row) => Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": format!("Row not found: {}", row_value),
                "sheetName": sheet_name,
                "searchedValue": row_value,
            }),
        )),
        Err(SearchMiss::Column) => Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": format!("Column not found: {}", column_value),
                "sheetName": sheet_name,
                "searchedValue": column_value,
                "availableColumns": grid.non_empty_headers(10),
            }),
        )),
    }
}

// ---------------------------------------------------------------------------
// /api/getrow
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRowParams {
    pub sheet_id: Option<String>,
    pub sheet_name: Option<String>,
    pub column_name: Option<String>,
    /// Older clients send the column header under this name
    pub row_value: Option<String>,
}

impl GetRowParams {
    fn column(&self) -> Option<&str> {
        present(&self.column_name).or_else(|| present(&self.row_value))
    }
}

/// GET /api/getrow: Every non-blank value under a column header
pub async fn getrow_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GetRowParams>,
) -> ApiResult {
    if present(&params.sheet_id).is_none() || present(&params.sheet_name).is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": {
                    "sheetId": "Sheet ID (query param)",
                    "sheetName": "Sheet name (query param)",
                    "columnName": "Column header name (query param)",
                },
                "example": "/api/getrow?sheetId=SHEET_ID&sheetName=WEB&columnName=May1",
            }),
        ));
    }
    getrow(&state, &params).await
}

/// POST /api/getrow: Same as GET with a JSON body
pub async fn getrow_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GetRowParams>, JsonRejection>,
) -> ApiResult {
    let Json(params) = body.map_err(body_error)?;
    if present(&params.sheet_id).is_none() || present(&params.sheet_name).is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["sheetId", "sheetName", "columnName or rowValue"],
            }),
        ));
    }
    getrow(&state, &params).await
}

async fn getrow(state: &AppState, params: &GetRowParams) -> ApiResult {
    let sheet_id = present(&params.sheet_id).unwrap_or_default();
    let sheet_name = present(&params.sheet_name).unwrap_or_default();

    let Some(column_name) = params.column() else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing column name",
                "required": "columnName",
                "description": "Column header name is required to get column data",
            }),
        ));
    };

    let grid = fetch(state, sheet_id, &format!("{}!{}", sheet_name, FULL_WIDTH)).await?;
    if grid.is_empty() {
        return Err(no_data());
    }

    let Some(col) = grid.find_header_containing(column_name) else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": format!("Column not found: {}", column_name),
                "sheetName": sheet_name,
                "searchedColumn": column_name,
                "availableColumns": grid.non_empty_headers(15),
            }),
        ));
    };

    Ok(Json(json!({
        "status": "success",
        "column": grid.cell(0, col),
        "values": grid.column_values(col),
    })))
}

// ---------------------------------------------------------------------------
// /api/sheets
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetsParams {
    pub sheet_id: Option<String>,
    pub sheet_name: Option<String>,
    pub mode: Option<String>,
    pub row_value: Option<String>,
    pub column_value: Option<String>,
    pub task: Option<String>,
    pub web: Option<String>,
    pub device: Option<String>,
}

/// GET /api/sheets: Mode lookups, task lookups, or self-documentation
pub async fn sheets_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SheetsParams>,
) -> ApiResult {
    let sheet_id = present(&params.sheet_id);

    if let (Some(mode), Some(sheet_id)) = (present(&params.mode), sheet_id) {
        let Some(sheet_name) = present(&params.sheet_name) else {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Missing sheetName parameter for mode operation",
                    "required": ["sheetId", "sheetName", "mode", "rowValue"],
                    "optional": ["columnValue"],
                    "examples": [
                        "/api/sheets?sheetId=SHEET_ID&sheetName=WEB&mode=search&rowValue=FUN_OTP&columnValue=May1",
                        "/api/sheets?sheetId=SHEET_ID&sheetName=WEB&mode=getrow&rowValue=May1",
                    ],
                }),
            ));
        };
        return mode_lookup(&state, sheet_id, sheet_name, mode, &params).await;
    }

    if let (Some(task), Some(sheet_id)) = (present(&params.task), sheet_id) {
        return task_lookup(&state, sheet_id, task, &params).await;
    }

    Ok(Json(documentation()))
}

async fn mode_lookup(
    state: &AppState,
    sheet_id: &str,
    sheet_name: &str,
    mode: &str,
    params: &SheetsParams,
) -> ApiResult {
    let grid = fetch(state, sheet_id, &format!("{}!{}", sheet_name, FULL_WIDTH)).await?;
    if grid.is_empty() {
        return Err(no_data());
    }

    match mode {
        "search" => {
            let (Some(row_value), Some(column_value)) =
                (present(&params.row_value), present(&params.column_value))
            else {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "Missing rowValue or columnValue for search mode" }),
                ));
            };
            let hit = grid
                .search(row_value, column_value)
                .map_err(|miss| search_miss(miss, row_value, column_value))?;

            Ok(Json(json!({
                "success": true,
                "coordinate": hit.coordinate(),
                "value": hit.value,
                "rowHeader": hit.row_header,
                "columnHeader": hit.column_header,
                "sheetName": sheet_name,
            })))
        }
        "getrow" => {
            let Some(column_name) = present(&params.row_value) else {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "Missing rowValue for getrow mode" }),
                ));
            };
            let Some(col) = grid.find_header_containing(column_name) else {
                return Err(api_error(
                    StatusCode::NOT_FOUND,
                    json!({ "error": format!("Column not found: {}", column_name) }),
                ));
            };

            // Rows are listed when either the key or the cell has content
            let data: Vec<Value> = (1..grid.len())
                .filter(|&r| !grid.cell(r, 0).is_empty() || !grid.cell(r, col).is_empty())
                .map(|r| {
                    json!({
                        "row": r + 1,
                        "rowId": grid.cell(r, 0),
                        "value": grid.cell(r, col),
                    })
                })
                .collect();

            Ok(Json(json!({
                "success": true,
                "columnHeader": grid.cell(0, col),
                "columnLetter": column_letter(col),
                "totalRows": data.len(),
                "data": data,
                "sheetName": sheet_name,
            })))
        }
        _ => Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Invalid mode" }),
        )),
    }
}

fn search_miss(miss: SearchMiss, row_value: &str, column_value: &str) -> ApiError {
    let error = match miss {
        SearchMiss::Row => format!("Row not found: {}", row_value),
        SearchMiss::Column => format!("Column not found: {}", column_value),
    };
    api_error(StatusCode::NOT_FOUND, json!({ "error": error }))
}

/// Look up a device column for a row key
///
/// `task=getAPI` keeps the old form where `web` names the sheet; any other
/// task is itself the sheet name. When no row matches `web`, the first
/// non-blank value in the device column is returned instead.
async fn task_lookup(state: &AppState, sheet_id: &str, task: &str, params: &SheetsParams) -> ApiResult {
    let (Some(web), Some(device)) = (present(&params.web), present(&params.device)) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing parameters",
                "required": {
                    "sheetId": "Sheet ID (query param)",
                    "task": "Task/Sheet name (query param)",
                    "web": "Row identifier (query param)",
                    "device": "Device/column name (query param)",
                },
                "examples": [
                    "/api/sheets?sheetId=YOUR_SHEET_ID&task=getAPI&web=WEB&device=May1",
                    "/api/sheets?sheetId=YOUR_SHEET_ID&task=WEB&web=FUN_OTP&device=May1",
                ],
            }),
        ));
    };

    let sheet_name = if task.eq_ignore_ascii_case("getapi") {
        web
    } else {
        task
    };
    log::info!("[GET API] SheetID: {}, Web: {}, Device: {}", sheet_id, web, device);

    let grid = fetch(state, sheet_id, sheet_name).await?;
    if grid.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({ "error": format!("Sheet '{}' is empty or not found", sheet_name) }),
        ));
    }

    let Some(col) = grid.find_header_exact(device) else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({ "error": format!("Device '{}' not found in sheet '{}'", device, sheet_name) }),
        ));
    };

    let key_api = match grid.find_row_exact(web) {
        Some(row) => grid.cell(row, col).to_string(),
        None => grid
            .column_values(col)
            .first()
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
    };

    Ok(Json(json!({
        "WEB": web,
        "KEY_API": key_api,
    })))
}

/// POST /api/sheets: Search or column dump with a JSON body
pub async fn sheets_post(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SheetsParams>, JsonRejection>,
) -> ApiResult {
    let Json(params) = body.map_err(body_error)?;

    let (Some(sheet_id), Some(sheet_name)) =
        (present(&params.sheet_id), present(&params.sheet_name))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": ["sheetId", "sheetName"],
                "received": {
                    "sheetId": present(&params.sheet_id).is_some(),
                    "sheetName": present(&params.sheet_name).is_some(),
                },
            }),
        ));
    };

    let mode = present(&params.mode).unwrap_or_default();
    log::info!("[POST] Processing {} request - Sheet: {}/{}", mode, sheet_id, sheet_name);

    let grid = fetch(&state, sheet_id, &format!("{}!{}", sheet_name, FULL_WIDTH)).await?;
    if grid.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": "No data found",
                "details": "Sheet is empty or does not exist",
            }),
        ));
    }

    match mode {
        "search" => {
            let (Some(row_value), Some(column_value)) =
                (present(&params.row_value), present(&params.column_value))
            else {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    json!({
                        "error": "Missing search parameters",
                        "required": ["rowValue", "columnValue"],
                        "received": {
                            "rowValue": present(&params.row_value).is_some(),
                            "columnValue": present(&params.column_value).is_some(),
                        },
                    }),
                ));
            };
            let hit = grid
                .search(row_value, column_value)
                .map_err(|miss| search_miss(miss, row_value, column_value))?;

            Ok(Json(json!({
                "success": true,
                "mode": "search",
                "data": {
                    "value": hit.value,
                    "row": hit.row + 1,
                    "column": column_letter(hit.col),
                    "rowHeader": hit.row_header,
                    "columnHeader": hit.column_header,
                },
                "timestamp": timestamp(),
            })))
        }
        "getrow" => {
            let Some(column_name) = present(&params.row_value) else {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    json!({
                        "error": "Missing column parameter",
                        "required": ["rowValue (column header name)"],
                        "received": { "rowValue": false },
                    }),
                ));
            };
            let Some(col) = grid.find_header_exact(column_name) else {
                return Err(api_error(
                    StatusCode::NOT_FOUND,
                    json!({ "error": format!("Column header not found: {}", column_name) }),
                ));
            };

            let data: Vec<Value> = (1..grid.len())
                .filter(|&r| !grid.cell(r, col).is_empty())
                .map(|r| json!({ "row": r + 1, "value": grid.cell(r, col) }))
                .collect();

            Ok(Json(json!({
                "success": true,
                "mode": "getColumn",
                "data": {
                    "columnHeader": grid.cell(0, col),
                    "columnIndex": col + 1,
                    "columnLetter": column_letter(col),
                    "totalValues": data.len(),
                    "data": data,
                },
                "timestamp": timestamp(),
            })))
        }
        other => Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Invalid mode",
                "validModes": ["search", "getrow"],
                "received": other,
            }),
        )),
    }
}

fn documentation() -> Value {
    json!({
        "name": "Google Sheets API",
        "version": crate::VERSION,
        "description": "Google Sheets access through Service Account authentication",
        "endpoints": {
            "getAPI_v1": {
                "method": "GET",
                "path": "/api/sheets?sheetId={SHEET_ID}&task=getAPI&web={SHEET_NAME}&device={DEVICE_NAME}",
                "description": "Legacy form: read KEY_API from the device column of the named sheet",
            },
            "getAPI_v2": {
                "method": "GET",
                "path": "/api/sheets?sheetId={SHEET_ID}&task={SHEET_NAME}&web={ROW_IDENTIFIER}&device={DEVICE_NAME}",
                "description": "task names the sheet, web names the row",
            },
            "response": {
                "WEB": "row_identifier",
                "KEY_API": "api_key_value",
            },
            "search": {
                "method": "POST",
                "description": "Value at the intersection of a row and a column",
                "body": {
                    "sheetId": "string",
                    "sheetName": "string",
                    "mode": "search",
                    "rowValue": "string",
                    "columnValue": "string",
                },
            },
            "getColumn": {
                "method": "POST",
                "description": "Every value in one column",
                "body": {
                    "sheetId": "string",
                    "sheetName": "string",
                    "mode": "getrow",
                    "rowValue": "string - Column header name",
                },
            },
            "cell": {
                "method": "GET",
                "path": "/api/sheets/{SHEET_ID}?task={SHEET_NAME}&web={ROW_IDENTIFIER}&device={COLUMN_NAME}",
            },
            "autoget": {
                "method": "GET",
                "path": "/api/autoget?sheetId={SHEET_ID}&sheetName={SHEET_NAME}[&reset=true]",
                "description": "Claim the next unused row and mark it used",
            },
        },
        "cors": "Enabled for all origins",
        "authentication": "Service Account (private sheets supported)",
    })
}

// ---------------------------------------------------------------------------
// /api/sheets/:sheet_id
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CellParams {
    pub task: Option<String>,
    pub web: Option<String>,
    pub device: Option<String>,
}

/// GET /api/sheets/:sheet_id: One cell addressed by row key and column name
pub async fn sheet_cell(
    State(state): State<Arc<AppState>>,
    Path(sheet_id): Path<String>,
    Query(params): Query<CellParams>,
) -> ApiResult {
    let (Some(task), Some(device)) = (present(&params.task), present(&params.device)) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            json!({
                "error": "Missing required parameters",
                "required": {
                    "sheetId": "Sheet ID (URL path)",
                    "task": "Sheet name (query param)",
                    "device": "Column name (query param)",
                },
                "example": "/api/sheets/SHEET_ID?task=WEB&web=TOTP&device=May1",
            }),
        ));
    };
    let web = present(&params.web);
    let sheet_id = sheet_id.as_str();

    let result = state
        .rotation
        .run(|client| async move { client.get_values(sheet_id, task).await })
        .await;

    let grid = match result {
        Ok(grid) => grid,
        Err(RotationError::Sheets(e)) if e.is_missing_range() => {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                json!({
                    "error": format!("Sheet '{}' not found", task),
                    "sheetId": sheet_id,
                    "requestedSheet": task,
                    "hint": "Please check if the sheet name exists in your Google Sheets document",
                }),
            ));
        }
        Err(e) => return Err(upstream_error(e)),
    };
    if grid.is_empty() {
        return Err(no_data());
    }

    let Some(col) = grid.find_header_exact(device) else {
        let all_columns = grid.non_empty_headers(usize::MAX);
        log::info!(
            "Column {:?} not found in {} headers",
            device,
            grid.headers().len()
        );
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": "Fail",
                "sheetName": task,
                "searchedColumn": device,
                "totalColumns": grid.headers().len(),
                "totalNonEmptyColumns": all_columns.len(),
                "availableColumns": all_columns,
            }),
        ));
    };

    let Some(row) = web.and_then(|w| grid.find_row_exact(w)) else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            json!({
                "error": format!("Row not found: {}", web.unwrap_or_default()),
                "sheetName": task,
                "searchedRow": web,
                "availableRows": grid.row_keys(10),
            }),
        ));
    };

    Ok(Json(json!({
        "status": "success",
        "web": web.unwrap_or_default(),
        "value": grid.cell(row, col),
    })))
}
