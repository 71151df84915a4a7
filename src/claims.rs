use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue entries older than this are treated as abandoned.
const QUEUE_ENTRY_TTL: Duration = Duration::from_secs(5 * 60);

/// How long a handed-out value is remembered after its status write.
const USED_VALUE_TTL: Duration = Duration::from_secs(60 * 60);

/// A spreadsheet tab, the unit rows are claimed within
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SheetKey {
    pub sheet_id: String,
    pub sheet_name: String,
}

impl SheetKey {
    pub fn new(sheet_id: &str, sheet_name: &str) -> Self {
        SheetKey {
            sheet_id: sheet_id.to_string(),
            sheet_name: sheet_name.to_string(),
        }
    }
}

impl fmt::Display for SheetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sheet_id, self.sheet_name)
    }
}

struct QueueEntry {
    id: String,
    enqueued_at: Instant,
}

struct UsedValue {
    sheet: SheetKey,
    row: usize,
    value: String,
    used_at: Instant,
}

#[derive(Default)]
struct ClaimState {
    queue: VecDeque<QueueEntry>,
    processing: HashMap<(SheetKey, usize), Instant>,
    used: Vec<UsedValue>,
}

/// Outcome of asking for a place in the admission queue
pub enum Admission {
    /// Queued; hold the ticket for the lifetime of the request
    Admitted(QueueTicket),
    /// Too many requests already queued
    Busy { queue_len: usize },
}

/// In-process coordinator that keeps concurrent autoget requests from
/// handing out the same row
///
/// Requests pass through a FIFO admission queue one at a time. The row a
/// request picks is marked as processing until the request finishes, and
/// every value handed out is remembered for an hour in case the status
/// write failed or a stale read still shows the row as free.
pub struct ClaimCoordinator {
    state: Mutex<ClaimState>,
    turn: Notify,
    busy_threshold: usize,
    row_timeout: Duration,
}

impl ClaimCoordinator {
    pub fn new(busy_threshold: usize, row_timeout: Duration) -> Arc<Self> {
        Arc::new(ClaimCoordinator {
            state: Mutex::new(ClaimState::default()),
            turn: Notify::new(),
            busy_threshold,
            row_timeout,
        })
    }

    fn state(&self) -> MutexGuard<'_, ClaimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the admission queue
    ///
    /// Stale queue entries and expired used values are purged first.
    ///
    /// # Arguments
    /// * `request_id` - Identifier of the calling request
    /// * `sheet` - Tab the request will claim from
    ///
    /// # Returns
    /// * `Admission` - A ticket, or `Busy` when the queue is over its threshold
    pub fn admit(self: &Arc<Self>, request_id: &str, sheet: &SheetKey) -> Admission {
        let now = Instant::now();
        let mut state = self.state();

        let before = state.queue.len();
        state
            .queue
            .retain(|entry| now.duration_since(entry.enqueued_at) < QUEUE_ENTRY_TTL);
        state
            .used
            .retain(|used| now.duration_since(used.used_at) < USED_VALUE_TTL);
        if state.queue.len() != before {
            self.turn.notify_waiters();
        }

        if state.queue.len() > self.busy_threshold {
            return Admission::Busy {
                queue_len: state.queue.len(),
            };
        }

        state.queue.push_back(QueueEntry {
            id: request_id.to_string(),
            enqueued_at: now,
        });
        log::info!(
            "[{}] Request added to queue. Queue size: {}",
            request_id,
            state.queue.len()
        );

        Admission::Admitted(QueueTicket {
            coordinator: Arc::clone(self),
            id: request_id.to_string(),
            sheet: sheet.clone(),
        })
    }

    /// 1-based queue position of `request_id`, or 0 when it is not queued
    pub fn position(&self, request_id: &str) -> usize {
        self.state()
            .queue
            .iter()
            .position(|entry| entry.id == request_id)
            .map_or(0, |idx| idx + 1)
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn processing_len(&self) -> usize {
        self.state().processing.len()
    }

    /// Pick the first candidate row nobody else holds, and hold it
    ///
    /// Expired processing markers are dropped before the scan. The pick and
    /// the marker are made under one lock.
    ///
    /// # Arguments
    /// * `sheet` - Tab the candidates belong to
    /// * `candidates` - `(row index, column A value)` pairs in sheet order
    ///
    /// # Returns
    /// * `Option<(usize, String)>` - The claimed row, or `None` if all are taken
    pub fn claim_first<I>(&self, sheet: &SheetKey, candidates: I) -> Option<(usize, String)>
    where
        I: IntoIterator<Item = (usize, String)>,
    {
        let now = Instant::now();
        let mut state = self.state();
        let row_timeout = self.row_timeout;

        state.processing.retain(|(key, row), since| {
            let live = now.duration_since(*since) <= row_timeout;
            if !live {
                log::info!("Cleaning up expired processing row: {} row {}", key, row + 1);
            }
            live
        });

        for (row, value) in candidates {
            let key = (sheet.clone(), row);
            if state.processing.contains_key(&key) {
                log::debug!("Skipping row {} - currently being processed", row + 1);
                continue;
            }
            let recently_used = state
                .used
                .iter()
                .any(|u| &u.sheet == sheet && u.row == row && u.value == value);
            if recently_used {
                continue;
            }

            state.processing.insert(key, now);
            return Some((row, value));
        }

        None
    }

    /// Remember that `value` at `row` was handed out
    pub fn remember_used(&self, sheet: &SheetKey, row: usize, value: &str) {
        self.state().used.push(UsedValue {
            sheet: sheet.clone(),
            row,
            value: value.to_string(),
            used_at: Instant::now(),
        });
    }

    /// Forget every handed-out value for `sheet`, after its statuses were reset
    pub fn forget_sheet(&self, sheet: &SheetKey) {
        self.state().used.retain(|u| &u.sheet != sheet);
    }

    fn release(&self, request_id: &str, sheet: &SheetKey) {
        let mut state = self.state();
        state.queue.retain(|entry| entry.id != request_id);

        state.processing.retain(|(key, _), _| key != sheet);

        log::info!(
            "[{}] Request completed. Queue size: {}, Processing rows: {}",
            request_id,
            state.queue.len(),
            state.processing.len()
        );
        drop(state);
        self.turn.notify_waiters();
    }
}

/// A place in the admission queue
///
/// Dropping the ticket leaves the queue, releases the processing markers
/// of its sheet and wakes the requests waiting behind it.
pub struct QueueTicket {
    coordinator: Arc<ClaimCoordinator>,
    id: String,
    sheet: SheetKey,
}

impl QueueTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until this request is at the head of the queue
    ///
    /// The caller bounds the wait with its own deadline.
    pub async fn wait_turn(&self) {
        loop {
            let notified = self.coordinator.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let position = self.coordinator.position(&self.id);
            if position <= 1 {
                return;
            }
            log::info!(
                "[{}] Waiting in queue. Position: {}/{}",
                self.id,
                position,
                self.coordinator.queue_len()
            );
            notified.await;
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.coordinator.release(&self.id, &self.sheet);
    }
}
