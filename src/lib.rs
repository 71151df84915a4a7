/*!
# Sheetgate

An HTTP gateway in front of Google Sheets, built in Rust.

## Overview

Sheetgate exposes a handful of JSON endpoints that read from and write to
private Google Sheets through one or more Service Account keys. Clients
look values up by row key and column header, dump whole columns, or claim
"the next unused row" of an account sheet so that each row is handed out
exactly once.

## Architecture

### HTTP Layer
- **Technologies**: Rust, axum, tower-http
- **Key Components**:
  - Router - Every API route answers GET, POST and CORS preflight
  - Request Logging - Method, path, status and latency per request
  - Browser Form - A static page for trying the endpoints by hand

### Spreadsheet Layer
- **Technologies**: reqwest, ring
- **Core Components**:
  - Credential Loader - Parses Service Account JSON and repairs flattened PEM keys
  - Token Source - Signs RS256 assertions and caches access tokens
  - Sheets Client - `values.get`, `values.update` and tab listing
  - Key Rotation - Moves to the next key on quota errors, with a cooldown per key

### Coordination Layer
- Admission queue that serializes row claims within the process
- Processing markers for rows between pick and status write
- Short-lived memory of values already handed out

## Modules

- **config**: Environment configuration
- **credentials**: Service Account parsing and private key normalization
- **auth**: Access tokens for a Service Account
- **sheets**: The `SheetsApi` seam and its Google implementation
- **rotation**: Quota-aware rotation over the configured keys
- **grid**: Lookups over a block of cells
- **claims**: Row-claim coordination for autoget
- **lookup**: Search, column and legacy `/api/sheets` endpoints
- **autoget**: Claim-the-next-row endpoint
- **app**: Routing, middleware and diagnostics

## REST API Endpoints

- `/api/search` - Value at a row/column intersection
- `/api/getrow` - Every value under a column header
- `/api/autoget` - Claim the next unused row (`reset=true` clears statuses)
- `/api/sheets`, `/api/sheets/{sheetId}` - Legacy lookups
- `/api/debug`, `/api/test-sheets`, `/api/test` - Diagnostics
- `/health` - Liveness
*/

pub mod app;
pub mod auth;
pub mod autoget;
pub mod claims;
pub mod config;
pub mod credentials;
pub mod grid;
pub mod lookup;
pub mod rotation;
pub mod sheets;

#[cfg(test)]
mod testing;

/// Crate version, reported by `/health` and the API documentation.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
