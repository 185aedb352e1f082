//! Per-query state, reconciled across two update channels.
//!
//! Status and progress arrive both from poll responses and from push traps,
//! and the two channels can reorder. Every update carries a version stamp;
//! a mutation applies only when its stamp strictly exceeds the last applied
//! one, so a late stale update can never regress visible state. Stamp zero
//! marks servers that predate stamping and always applies.

use chrono::{DateTime, FixedOffset};
use tokio::sync::watch;

/// Query lifecycle state. `Ended` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Stopped,
    Running,
    Ended,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Ended | QueryStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Stopped => "Stopped",
            QueryStatus::Running => "Running",
            QueryStatus::Ended => "Ended",
            QueryStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<QueryStatus> {
        match s {
            "Stopped" => Some(QueryStatus::Stopped),
            "Running" => Some(QueryStatus::Running),
            "Ended" => Some(QueryStatus::Ended),
            "Cancelled" => Some(QueryStatus::Cancelled),
            _ => None,
        }
    }
}

/// Why a query was cancelled. Steady-state information, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller fetched only part of the result on purpose
    PartialFetch,
    /// Explicit cancellation by the user
    UserRequest,
    /// The connection to the server was lost
    NetworkFailure,
    /// The server failed while running the query
    ServerError,
}

impl CancelReason {
    pub fn parse(s: &str) -> Option<CancelReason> {
        match s {
            "partial_fetch" => Some(CancelReason::PartialFetch),
            "user_request" => Some(CancelReason::UserRequest),
            "network_failure" => Some(CancelReason::NetworkFailure),
            "server_error" => Some(CancelReason::ServerError),
            _ => None,
        }
    }
}

/// One command in a query pipeline, as reported by the server.
#[derive(Debug, Clone, Default)]
pub struct QueryCommand {
    pub name: String,
    pub status: String,
    pub push_count: Option<i64>,
    pub command: Option<String>,
    pub children: Vec<QueryCommand>,
}

/// A sub-query of a federated query.
#[derive(Debug, Clone, Default)]
pub struct SubQuery {
    pub id: i64,
    pub commands: Vec<QueryCommand>,
}

#[derive(Debug)]
struct QueryState {
    status: QueryStatus,
    loaded_count: u64,
    stamp: u64,
    error_code: Option<i64>,
    error_detail: Option<String>,
    cancel_reason: Option<CancelReason>,
    commands: Vec<QueryCommand>,
    sub_queries: Vec<SubQuery>,
    start_time: Option<DateTime<FixedOffset>>,
    finish_time: Option<DateTime<FixedOffset>>,
    elapsed_ms: Option<i64>,
    field_order: Option<Vec<String>>,
}

/// Tracked state of one server-side query.
#[derive(Debug)]
pub struct Query {
    id: i64,
    text: String,
    state: parking_lot::Mutex<QueryState>,
    progress: watch::Sender<(QueryStatus, u64)>,
}

impl Query {
    pub fn new(id: i64, text: &str) -> Query {
        let (progress, _) = watch::channel((QueryStatus::Stopped, 0));
        Query {
            id,
            text: text.to_string(),
            state: parking_lot::Mutex::new(QueryState {
                status: QueryStatus::Stopped,
                loaded_count: 0,
                stamp: 0,
                error_code: None,
                error_detail: None,
                cancel_reason: None,
                commands: Vec::new(),
                sub_queries: Vec::new(),
                start_time: None,
                finish_time: None,
                elapsed_ms: None,
                field_order: None,
            }),
            progress,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> QueryStatus {
        self.state.lock().status
    }

    pub fn loaded_count(&self) -> u64 {
        self.state.lock().loaded_count
    }

    pub fn stamp(&self) -> u64 {
        self.state.lock().stamp
    }

    pub fn error_code(&self) -> Option<i64> {
        self.state.lock().error_code
    }

    pub fn error_detail(&self) -> Option<String> {
        self.state.lock().error_detail.clone()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.state.lock().cancel_reason
    }

    pub fn commands(&self) -> Vec<QueryCommand> {
        self.state.lock().commands.clone()
    }

    pub fn sub_queries(&self) -> Vec<SubQuery> {
        self.state.lock().sub_queries.clone()
    }

    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        self.state.lock().start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<FixedOffset>> {
        self.state.lock().finish_time
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        self.state.lock().elapsed_ms
    }

    pub fn field_order(&self) -> Option<Vec<String>> {
        self.state.lock().field_order.clone()
    }

    /// Apply one stamped update atomically, gated by the version stamp.
    ///
    /// Count and status arriving in the same message share one stamp and
    /// must apply (or be discarded) together. A stamp of zero always
    /// applies and never advances the stored stamp.
    pub fn apply_update(&self, count: Option<u64>, status: Option<QueryStatus>, stamp: u64) {
        let mut state = self.state.lock();
        if stamp != 0 && state.stamp >= stamp {
            return;
        }
        if stamp != 0 {
            state.stamp = stamp;
        }
        if let Some(count) = count {
            state.loaded_count = count;
        }
        if let Some(status) = status {
            state.status = status;
        }
        self.progress.send_replace((state.status, state.loaded_count));
    }

    /// Apply a loaded-count update, gated by stamp.
    pub fn update_count(&self, count: u64, stamp: u64) {
        self.apply_update(Some(count), None, stamp);
    }

    /// Apply a status transition, gated by stamp.
    pub fn update_status(&self, status: QueryStatus, stamp: u64) {
        self.apply_update(None, Some(status), stamp);
    }

    /// Record why the query was cancelled. Not stamp-gated: the reason is
    /// set by whichever channel reports the terminal transition.
    pub fn set_failure(
        &self,
        reason: Option<CancelReason>,
        error_code: Option<i64>,
        error_detail: Option<String>,
    ) {
        let mut state = self.state.lock();
        state.cancel_reason = reason;
        state.error_code = error_code;
        state.error_detail = error_detail;
    }

    pub fn set_commands(&self, commands: Vec<QueryCommand>) {
        self.state.lock().commands = commands;
    }

    pub fn set_sub_queries(&self, sub_queries: Vec<SubQuery>) {
        self.state.lock().sub_queries = sub_queries;
    }

    pub fn set_times(
        &self,
        start_time: Option<DateTime<FixedOffset>>,
        finish_time: Option<DateTime<FixedOffset>>,
        elapsed_ms: Option<i64>,
    ) {
        let mut state = self.state.lock();
        if start_time.is_some() {
            state.start_time = start_time;
        }
        if finish_time.is_some() {
            state.finish_time = finish_time;
        }
        state.elapsed_ms = elapsed_ms;
    }

    pub fn set_field_order(&self, fields: Option<Vec<String>>) {
        self.state.lock().field_order = fields;
    }

    /// Wait until the query reaches a terminal state or `count` rows are
    /// loaded; `None` waits for the terminal state only.
    pub async fn wait_until(&self, count: Option<u64>) {
        let mut rx = self.progress.subscribe();
        loop {
            {
                let (status, loaded) = *rx.borrow_and_update();
                if status.is_terminal() {
                    return;
                }
                if let Some(threshold) = count {
                    if loaded >= threshold {
                        return;
                    }
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
