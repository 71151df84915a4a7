use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::sheets::{SheetsApi, SheetsError};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("no service account keys configured")]
    NoCredentials,

    #[error("all service account keys are cooling down")]
    AllKeysCoolingDown,

    #[error(transparent)]
    Sheets(#[from] SheetsError),
}

struct RotationState {
    cursor: usize,
    failures: Vec<u32>,
    last_failure: Vec<Option<Instant>>,
}

/// Per-key view reported by the debug endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub index: usize,
    pub label: String,
    pub failures: u32,
    pub cooldown_remaining_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationSnapshot {
    pub current: usize,
    pub keys: Vec<KeyStatus>,
}

/// Rotation policy over a fixed set of service-account clients
///
/// A shared cursor names the preferred key. A quota failure stamps the
/// failing key and moves the cursor past it; stamped keys are skipped until
/// their cooldown elapses.
pub struct KeyRotation {
    clients: Vec<Arc<dyn SheetsApi>>,
    cooldown: Duration,
    state: Mutex<RotationState>,
}

impl KeyRotation {
    pub fn new(clients: Vec<Arc<dyn SheetsApi>>, cooldown: Duration) -> Self {
        let n = clients.len();
        KeyRotation {
            clients,
            cooldown,
            state: Mutex::new(RotationState {
                cursor: 0,
                failures: vec![0; n],
                last_failure: vec![None; n],
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooling(&self, state: &RotationState, idx: usize, now: Instant) -> bool {
        state.last_failure[idx].is_some_and(|at| now.duration_since(at) < self.cooldown)
    }

    /// Pick the key to use for the next call
    ///
    /// # Returns
    /// * `Option<usize>` - The current key if usable, else the next usable one
    ///   in ring order (which becomes current); `None` if every key is cooling
    pub fn select(&self) -> Option<usize> {
        let n = self.clients.len();
        if n == 0 {
            return None;
        }

        let now = Instant::now();
        let mut state = self.state();

        if !self.cooling(&state, state.cursor, now) {
            return Some(state.cursor);
        }

        for step in 1..n {
            let idx = (state.cursor + step) % n;
            if !self.cooling(&state, idx, now) {
                log::info!("Switched to service account key {}", idx + 1);
                state.cursor = idx;
                return Some(idx);
            }
        }

        log::error!("All service account keys are in cooldown");
        None
    }

    /// Stamp a quota failure on `idx` and move the cursor past it
    pub fn record_failure(&self, idx: usize) {
        let n = self.clients.len();
        if idx >= n {
            return;
        }

        let mut state = self.state();
        state.failures[idx] += 1;
        state.last_failure[idx] = Some(Instant::now());
        state.cursor = (idx + 1) % n;

        log::warn!(
            "Key {} failed. Failure count: {}. Next key: {}",
            idx + 1,
            state.failures[idx],
            state.cursor + 1
        );
    }

    /// The first configured key, ignoring cooldown
    pub fn first(&self) -> Option<Arc<dyn SheetsApi>> {
        self.clients.first().cloned()
    }

    /// Run `op` against the selected key, rotating on quota errors
    ///
    /// Each key gets at most one attempt. Errors other than quota errors are
    /// returned immediately without touching the rotation state.
    ///
    /// # Arguments
    /// * `op` - The call to make; receives the client for the chosen key
    ///
    /// # Returns
    /// * `Result<T, RotationError>` - The first successful result, or the last quota error
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RotationError>
    where
        F: FnMut(Arc<dyn SheetsApi>) -> Fut,
        Fut: Future<Output = Result<T, SheetsError>>,
    {
        if self.clients.is_empty() {
            return Err(RotationError::NoCredentials);
        }

        let mut last_error = None;
        for attempt in 0..self.clients.len() {
            let Some(idx) = self.select() else {
                break;
            };
            let client = Arc::clone(&self.clients[idx]);
            log::debug!(
                "Attempt {}/{} with key {} ({})",
                attempt + 1,
                self.clients.len(),
                idx + 1,
                client.label()
            );

            match op(client).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_quota() => {
                    log::warn!("Quota exceeded for key {}, trying next key", idx + 1);
                    self.record_failure(idx);
                    last_error = Some(e);
                }
                Err(e) => {
                    log::error!("Non-quota error with key {}: {}", idx + 1, e);
                    return Err(e.into());
                }
            }
        }

        Err(last_error
            .map(RotationError::from)
            .unwrap_or(RotationError::AllKeysCoolingDown))
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        let now = Instant::now();
        let state = self.state();
        let keys = self
            .clients
            .iter()
            .enumerate()
            .map(|(idx, client)| KeyStatus {
                index: idx + 1,
                label: client.label().to_string(),
                failures: state.failures[idx],
                cooldown_remaining_secs: state.last_failure[idx]
                    .map(|at| self.cooldown.saturating_sub(now.duration_since(at)).as_secs())
                    .unwrap_or(0),
            })
            .collect();

        RotationSnapshot {
            current: state.cursor + 1,
            keys,
        }
    }
}
