//! Client facade: login, query management, result paging, ingestion.
//!
//! The facade owns the duplex connection and registers itself as its trap
//! listener. Lifecycle and progress traps feed the stamp-gated query
//! tracker; streamed result traps are decoded through the columnar codec
//! and handed to per-query stream handlers.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use dashmap::DashMap;
use tracing::{debug, error, warn};

use tidelog_common::{Error, Result, Row, Value};
use tidelog_protocol::{streaming, Chunk, Envelope, StreamCodec};

use crate::config::ClientConfig;
use crate::connection::{Connection, Rpc, TrapListener};
use crate::cursor::{Cursor, PageFetcher, ResultPage};
use crate::ingest::{FailureListener, IngestConfig, Ingestor, InsertHandle};
use crate::query::{CancelReason, Query, QueryCommand, QueryStatus, SubQuery};

const LOGIN_METHOD: &str = "tidelog.auth.login";
const LOGOUT_METHOD: &str = "tidelog.auth.logout";
const SUBSCRIBE_METHOD: &str = "tidelog.push.subscribe";
const UNSUBSCRIBE_METHOD: &str = "tidelog.push.unsubscribe";
const QUERY_CREATE_METHOD: &str = "tidelog.query.create";
const QUERY_START_METHOD: &str = "tidelog.query.start";
const QUERY_STOP_METHOD: &str = "tidelog.query.stop";
const QUERY_REMOVE_METHOD: &str = "tidelog.query.remove";
const QUERY_STATUS_METHOD: &str = "tidelog.query.status";
const QUERY_LIST_METHOD: &str = "tidelog.query.list";
const QUERY_LIST_ALL_METHOD: &str = "tidelog.query.listAll";
const QUERY_PAGE_METHOD: &str = "tidelog.query.page";

/// Push channel for query lifecycle and progress events.
const QUERY_CHANNEL_PREFIX: &str = "query-";
/// Push channel for streamed result chunks.
const RESULT_CHANNEL_PREFIX: &str = "query-result-";

/// Consumer of streamed query results.
///
/// `last` marks the final delivery for the query; it fires exactly once,
/// even when the final chunk fails to decode (with an empty row list).
pub trait StreamHandler: Send + Sync {
    fn on_rows(&self, query: &Query, rows: Vec<Row>, last: bool);
}

/// Handle to a connected tidelog session. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    conn: Arc<Connection>,
    codec: Arc<StreamCodec>,
    ingestor: Arc<Ingestor>,
    queries: DashMap<i64, Arc<Query>>,
    stream_handlers: DashMap<i64, Arc<dyn StreamHandler>>,
}

impl Client {
    /// Connect and log in with default settings.
    pub async fn connect(host: &str, port: u16, user: &str, password: &str) -> Result<Client> {
        let config = ClientConfig {
            host: host.to_string(),
            port,
            ..ClientConfig::default()
        };
        Self::connect_with(config, user, password).await
    }

    /// Connect and log in with explicit settings.
    pub async fn connect_with(config: ClientConfig, user: &str, password: &str) -> Result<Client> {
        config.validate()?;
        let conn = Connection::open(&config).await?;
        Self::connect_over(conn, config, user, password).await
    }

    /// Log in over an already established duplex channel.
    pub async fn connect_over(
        conn: Arc<Connection>,
        config: ClientConfig,
        user: &str,
        password: &str,
    ) -> Result<Client> {
        config.validate()?;
        let codec = Arc::new(match config.codec_parallelism {
            0 => StreamCodec::with_default_parallelism(),
            n => StreamCodec::new(n)?,
        });
        let ingest_config = IngestConfig {
            max_pending_rows: config.max_pending_rows,
            insert_batch_size: config.insert_batch_size,
            flush_interval: config.flush_interval,
        };
        let ingestor = Ingestor::new(
            Arc::clone(&conn) as Arc<dyn Rpc>,
            Arc::clone(&codec),
            ingest_config,
        );

        let inner = Arc::new(ClientInner {
            config,
            conn,
            codec,
            ingestor,
            queries: DashMap::new(),
            stream_handlers: DashMap::new(),
        });

        if let Err(e) = inner.login(user, password, true).await {
            inner.conn.shutdown_with(None).await;
            return Err(e);
        }
        inner
            .conn
            .add_listener(Arc::clone(&inner) as Arc<dyn TrapListener>);

        Ok(Client { inner })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Log out explicitly; the connection stays usable for a re-login only
    /// on the server's terms, so most callers want [`Client::close`].
    pub async fn logout(&self) -> Result<()> {
        self.inner.call(LOGOUT_METHOD, HashMap::new()).await?;
        Ok(())
    }

    /// Drain the ingestion pipeline, log out best-effort and shut the
    /// connection down.
    pub async fn close(&self) -> Result<()> {
        self.inner.ingestor.shutdown().await;
        if !self.inner.conn.is_closed() {
            let _ = self
                .inner
                .conn
                .call(LOGOUT_METHOD, HashMap::new(), Some(Duration::from_secs(5)))
                .await;
        }
        self.inner.conn.shutdown_with(None).await;
        Ok(())
    }

    /// Invoke an arbitrary remote method.
    ///
    /// `timeout` of `None` waits indefinitely; on expiry the call fails with
    /// a timeout distinct from connection loss.
    pub async fn call(
        &self,
        method: &str,
        params: HashMap<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        self.inner.conn.call(method, params, timeout).await
    }

    /// Start receiving traps on a named push channel.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.inner.subscribe(channel.to_string()).await
    }

    /// Stop receiving traps on a named push channel.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.inner.unsubscribe(channel.to_string()).await
    }

    /// Create a query; it starts in the Stopped state.
    pub async fn create_query(&self, text: &str) -> Result<i64> {
        self.inner.create_query(text, None).await
    }

    /// Create a query whose results stream to `handler` as they load.
    pub async fn create_query_with_stream(
        &self,
        text: &str,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<i64> {
        self.inner.create_query(text, Some(handler)).await
    }

    pub async fn start_query(&self, id: i64) -> Result<()> {
        let params = id_params(id);
        self.inner.call(QUERY_START_METHOD, params).await?;
        Ok(())
    }

    pub async fn stop_query(&self, id: i64) -> Result<()> {
        let params = id_params(id);
        self.inner.call(QUERY_STOP_METHOD, params).await?;
        Ok(())
    }

    /// Remove a query and its server-side result, unsubscribing its push
    /// channels first.
    pub async fn remove_query(&self, id: i64) -> Result<()> {
        self.inner.remove_query(id).await
    }

    /// Poll the server for the current status of a query and fold it into
    /// the local tracker.
    pub async fn query_status(&self, id: i64) -> Result<Arc<Query>> {
        self.inner.query_status(id).await
    }

    /// Queries owned by this session.
    pub async fn queries(&self) -> Result<Vec<Arc<Query>>> {
        let resp = self.inner.call(QUERY_LIST_METHOD, HashMap::new()).await?;
        self.inner.fold_query_listing(&resp);
        Ok(self
            .inner
            .queries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect())
    }

    /// Every query running on the server. Requires admin rights.
    pub async fn all_queries(&self) -> Result<Vec<Arc<Query>>> {
        let resp = self.inner.call(QUERY_LIST_ALL_METHOD, HashMap::new()).await?;
        let mut out = Vec::new();
        if let Some(items) = resp.param("queries").and_then(Value::as_array) {
            for item in items {
                if let Some(m) = item.as_map() {
                    if let Some(id) = m.get("id").and_then(Value::as_i64) {
                        let text = m.get("query").and_then(Value::as_str).unwrap_or("");
                        let query = Arc::new(Query::new(id, text));
                        apply_status_response(&query, m);
                        out.push(query);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Locally tracked query record, if any.
    pub fn get_query(&self, id: i64) -> Option<Arc<Query>> {
        self.inner.query(id)
    }

    /// Block until the query is terminal or has loaded `count` rows.
    pub async fn wait_until(&self, id: i64, count: Option<u64>) -> Result<()> {
        let query = self.inner.query(id).ok_or(Error::QueryNotFound(id))?;
        query.wait_until(count).await;
        Ok(())
    }

    /// Run a query to completion and return a cursor over its result.
    ///
    /// The cursor owns the query: closing it removes the server-side
    /// result.
    pub async fn query(&self, text: &str) -> Result<Cursor> {
        let id = self.inner.create_query(text, None).await?;
        self.start_query(id).await?;

        let query = self.inner.query(id).ok_or(Error::QueryNotFound(id))?;
        query.wait_until(None).await;

        if query.status() == QueryStatus::Cancelled {
            let reason = match (query.error_code(), query.error_detail()) {
                (Some(code), Some(detail)) => format!("error {} [{}]", code, detail),
                (_, Some(detail)) => detail,
                _ => format!("{:?}", query.cancel_reason()),
            };
            return Err(Error::QueryCancelled { id, reason });
        }

        let total = query.loaded_count();
        Ok(Cursor::new(
            Arc::clone(&self.inner) as Arc<dyn PageFetcher>,
            id,
            0,
            total,
            true,
            self.inner.config.fetch_size,
        ))
    }

    /// Fetch one result page, transparently decoding the compressed binary
    /// form when the server offers it.
    pub async fn fetch_page(&self, id: i64, offset: u64, limit: usize) -> Result<ResultPage> {
        PageFetcher::fetch_page(&*self.inner, id, offset, limit).await
    }

    /// Queue rows for insertion into `table`. Blocks only while the
    /// in-flight row budget is exhausted.
    pub async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<InsertHandle> {
        self.inner.ingestor.submit(table, rows).await
    }

    /// Queue a single row for insertion into `table`.
    pub async fn insert_one(&self, table: &str, row: Row) -> Result<InsertHandle> {
        self.inner.ingestor.submit(table, vec![row]).await
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.inner.ingestor.add_failure_listener(listener);
    }

    pub fn remove_failure_listener(&self, listener: &Arc<dyn FailureListener>) {
        self.inner.ingestor.remove_failure_listener(listener);
    }

    pub fn ingest_metrics(&self) -> Arc<tidelog_common::metrics::IngestMetrics> {
        self.inner.ingestor.metrics()
    }
}

impl ClientInner {
    async fn call(&self, method: &str, params: HashMap<String, Value>) -> Result<Envelope> {
        self.conn.call(method, params, self.config.request_timeout).await
    }

    fn query(&self, id: i64) -> Option<Arc<Query>> {
        self.queries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_insert_query(&self, id: i64, text: &str) -> Arc<Query> {
        Arc::clone(
            self.queries
                .entry(id)
                .or_insert_with(|| Arc::new(Query::new(id, text)))
                .value(),
        )
    }

    async fn login(&self, user: &str, password: &str, force: bool) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("login_name".to_string(), Value::from(user));
        params.insert("password".to_string(), Value::from(password));
        params.insert("force".to_string(), Value::Bool(force));
        params.insert("use_error_return".to_string(), Value::Bool(true));

        let resp = match self
            .conn
            .call(LOGIN_METHOD, params, Some(self.config.connect_timeout))
            .await
        {
            Ok(resp) => resp,
            Err(Error::Rpc { code, .. }) if code == "method-not-found" => {
                return Err(Error::LoginFailure(code))
            }
            Err(e) => return Err(e),
        };

        if let Some(code) = resp.get_str("error_code") {
            return Err(Error::LoginFailure(code.to_string()));
        }
        if let Some(token) = resp.get_str("session") {
            self.conn.set_session_token(Some(token.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("channel".to_string(), Value::String(channel));
        self.call(SUBSCRIBE_METHOD, params).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: String) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("channel".to_string(), Value::String(channel));
        self.call(UNSUBSCRIBE_METHOD, params).await?;
        Ok(())
    }

    async fn create_query(
        &self,
        text: &str,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Result<i64> {
        let mut params = HashMap::new();
        params.insert("query".to_string(), Value::from(text));
        let resp = self.call(QUERY_CREATE_METHOD, params).await?;
        let id = resp
            .get_i64("id")
            .ok_or_else(|| Error::Protocol("create response missing query id".to_string()))?;

        self.queries.insert(id, Arc::new(Query::new(id, text)));
        self.subscribe(format!("{}{}", QUERY_CHANNEL_PREFIX, id)).await?;

        if let Some(handler) = handler {
            self.stream_handlers.insert(id, handler);
            self.subscribe(format!("{}{}", RESULT_CHANNEL_PREFIX, id)).await?;
        }

        Ok(id)
    }

    async fn remove_query(&self, id: i64) -> Result<()> {
        if self.stream_handlers.remove(&id).is_some() {
            self.unsubscribe(format!("{}{}", RESULT_CHANNEL_PREFIX, id)).await?;
        }
        self.unsubscribe(format!("{}{}", QUERY_CHANNEL_PREFIX, id)).await?;

        let params = id_params(id);
        self.call(QUERY_REMOVE_METHOD, params).await?;
        self.queries.remove(&id);
        Ok(())
    }

    async fn query_status(&self, id: i64) -> Result<Arc<Query>> {
        let params = id_params(id);
        match self.call(QUERY_STATUS_METHOD, params).await {
            Ok(resp) => {
                let text = resp.get_str("query").unwrap_or("").to_string();
                let query = self.get_or_insert_query(id, &text);
                apply_status_response(&query, &resp.params);
            }
            // older servers have no status poll; the tracker still follows
            // push traps
            Err(Error::Rpc { code, .. }) if code == "method-not-found" => {}
            Err(e) => return Err(e),
        }
        self.query(id).ok_or(Error::QueryNotFound(id))
    }

    fn fold_query_listing(&self, resp: &Envelope) {
        let Some(items) = resp.param("queries").and_then(Value::as_array) else {
            return;
        };
        for item in items {
            let Some(m) = item.as_map() else { continue };
            let Some(id) = m.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let text = m.get("query").and_then(Value::as_str).unwrap_or("");
            let query = self.get_or_insert_query(id, text);
            apply_status_response(&query, m);
        }
    }

    async fn handle_result_trap(&self, id: i64, trap: Envelope) {
        let last = trap.get_bool("last").unwrap_or(false);
        let (query, handler) = match (self.query(id), self.stream_handlers.get(&id)) {
            (Some(q), Some(h)) => (q, Arc::clone(h.value())),
            _ => {
                debug!(id, "streamed result for unknown query, dropping");
                return;
            }
        };

        let decoded: Result<Vec<Row>> = match trap.param("bins") {
            Some(Value::Array(bins)) => match bins
                .iter()
                .map(Chunk::from_value)
                .collect::<Result<Vec<Chunk>>>()
            {
                Ok(chunks) => self.codec.decode(chunks).await,
                Err(e) => Err(e),
            },
            _ => Ok(trap
                .param("rows")
                .and_then(Value::as_array)
                .map(rows_from_values)
                .unwrap_or_default()),
        };

        match decoded {
            Ok(rows) => {
                if let Some(stamp) = trap.get_u64("stamp") {
                    apply_lifecycle_trap(&query, &trap, stamp);
                }
                handler.on_rows(&query, rows, last);
            }
            Err(e) => {
                error!(id, "cannot decode streaming result: {}", e);
                if last {
                    // the terminal callback still fires exactly once
                    handler.on_rows(&query, Vec::new(), true);
                }
            }
        }
    }
}

#[async_trait]
impl TrapListener for ClientInner {
    async fn on_trap(&self, trap: Envelope) {
        // result channel first: its name embeds the lifecycle prefix
        if let Some(id) = parse_channel_id(&trap.method, RESULT_CHANNEL_PREFIX) {
            self.handle_result_trap(id, trap).await;
        } else if let Some(id) = parse_channel_id(&trap.method, QUERY_CHANNEL_PREFIX) {
            let stamp = trap.get_u64("stamp").unwrap_or(0);
            match self.query(id) {
                Some(query) => apply_lifecycle_trap(&query, &trap, stamp),
                None => debug!(id, "lifecycle trap for unknown query, dropping"),
            }
        }
    }

    async fn on_close(&self, cause: Option<&Error>) {
        for entry in self.queries.iter() {
            let query = entry.value();
            match cause {
                Some(e) => query.set_failure(
                    Some(CancelReason::NetworkFailure),
                    None,
                    Some(e.to_string()),
                ),
                None => query.set_failure(Some(CancelReason::UserRequest), None, None),
            }
            query.update_status(QueryStatus::Cancelled, u64::MAX);

            if let Some(handler) = self.stream_handlers.get(&query.id()) {
                let handler = Arc::clone(handler.value());
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_rows(query, Vec::new(), true)
                }));
                if result.is_err() {
                    error!(id = query.id(), "stream handler panicked on close");
                }
            }
        }
        self.ingestor.begin_shutdown();
    }
}

#[async_trait]
impl PageFetcher for ClientInner {
    async fn fetch_page(&self, id: i64, offset: u64, limit: usize) -> Result<ResultPage> {
        if !self.queries.contains_key(&id) {
            return Err(Error::QueryNotFound(id));
        }

        let mut params = id_params(id);
        params.insert("offset".to_string(), Value::Int(offset as i64));
        params.insert("limit".to_string(), Value::Int(limit as i64));
        params.insert("binary_encode".to_string(), Value::Bool(true));

        let resp = self.call(QUERY_PAGE_METHOD, params).await?;
        if resp.params.is_empty() {
            return Err(Error::QueryNotFound(id));
        }

        // the compressed binary form is optional: older servers answer with
        // the plain inline page
        let binary = match (resp.get_u64("uncompressed_size"), resp.get_str("binary")) {
            (Some(size), Some(bin)) => Some((size as usize, bin.to_string())),
            _ => None,
        };
        let page = match binary {
            Some((size, bin)) => streaming::decode_binary_page(&bin, size)?,
            None => resp.params,
        };
        Ok(parse_result_page(&page))
    }

    async fn remove_query(&self, id: i64) -> Result<()> {
        ClientInner::remove_query(self, id).await
    }
}

fn id_params(id: i64) -> HashMap<String, Value> {
    let mut params = HashMap::new();
    params.insert("id".to_string(), Value::Int(id));
    params
}

fn parse_channel_id(method: &str, prefix: &str) -> Option<i64> {
    method.strip_prefix(prefix).and_then(|rest| rest.parse().ok())
}

fn rows_from_values(items: &[Value]) -> Vec<Row> {
    items
        .iter()
        .filter_map(|item| item.as_map().cloned())
        .collect()
}

fn parse_result_page(page: &HashMap<String, Value>) -> ResultPage {
    let rows = page
        .get("result")
        .and_then(Value::as_array)
        .map(rows_from_values)
        .unwrap_or_default();
    let total = page
        .get("count")
        .and_then(Value::as_i64)
        .map(|n| n.max(0) as u64)
        .unwrap_or(rows.len() as u64);
    let fields = page.get("fields").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    });
    ResultPage { rows, total, fields }
}

/// Fold one lifecycle trap into the tracker. Count and status carried by
/// the same trap apply under one stamp.
fn apply_lifecycle_trap(query: &Query, trap: &Envelope, stamp: u64) {
    match trap.get_str("type") {
        Some("eof") => {
            let count = trap.get_u64("total_count");
            let reason = trap.get_str("cancel_reason").map(CancelReason::parse);
            match reason {
                Some(parsed) if parsed != Some(CancelReason::PartialFetch) => {
                    query.set_failure(
                        parsed.or(Some(CancelReason::ServerError)),
                        trap.get_i64("error_code"),
                        trap.get_str("error_detail").map(str::to_string),
                    );
                    query.apply_update(count, Some(QueryStatus::Cancelled), stamp);
                }
                _ => query.apply_update(count, Some(QueryStatus::Ended), stamp),
            }
        }
        Some("page_loaded") => {
            query.apply_update(trap.get_u64("count"), Some(QueryStatus::Running), stamp);
        }
        Some("status_change") => {
            let status = trap.get_str("status").and_then(QueryStatus::parse);
            if status.is_none() {
                warn!(method = %trap.method, "unknown status in status_change trap");
            }
            query.apply_update(trap.get_u64("count"), status, stamp);
        }
        other => debug!(?other, "ignoring lifecycle trap"),
    }
}

/// Fold one status poll response (or listing entry) into the tracker.
fn apply_status_response(query: &Query, params: &HashMap<String, Value>) {
    let stamp = params
        .get("stamp")
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0);

    let commands: Vec<QueryCommand> = params
        .get("commands")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_command).collect())
        .unwrap_or_default();
    let first_waiting = commands
        .first()
        .map(|c| c.status.eq_ignore_ascii_case("Waiting"))
        .unwrap_or(false);
    query.set_commands(commands);

    if let Some(subs) = params.get("sub_queries").and_then(Value::as_array) {
        query.set_sub_queries(subs.iter().filter_map(parse_sub_query).collect());
    }

    let count = params
        .get("rows")
        .and_then(Value::as_i64)
        .map(|n| n.max(0) as u64);

    let end = params.get("is_end").and_then(Value::as_bool).unwrap_or(false);
    let eof = params.get("is_eof").and_then(Value::as_bool).unwrap_or(end);
    let cancelled = params
        .get("is_cancelled")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let status = if eof {
        if cancelled {
            Some(QueryStatus::Cancelled)
        } else if !first_waiting {
            Some(QueryStatus::Ended)
        } else {
            None
        }
    } else if end {
        Some(QueryStatus::Stopped)
    } else {
        Some(QueryStatus::Running)
    };
    query.apply_update(count, status, stamp);

    query.set_times(
        params.get("start_time").and_then(parse_instant),
        params.get("finish_time").and_then(parse_instant),
        params.get("elapsed").and_then(Value::as_i64),
    );
    if let Some(fields) = params.get("fields").and_then(Value::as_array) {
        query.set_field_order(Some(
            fields
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ));
    }
}

/// Timestamps in status responses arrive as epoch millis or as date values.
fn parse_instant(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::Date(d) => Some(*d),
        Value::Int(0) => None,
        Value::Int(ms) => Utc
            .timestamp_millis_opt(*ms)
            .single()
            .map(|d| d.fixed_offset()),
        _ => None,
    }
}

fn parse_command(value: &Value) -> Option<QueryCommand> {
    let m = value.as_map()?;
    Some(QueryCommand {
        name: m
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: m
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        push_count: m.get("push_count").and_then(Value::as_i64),
        command: m.get("command").and_then(Value::as_str).map(str::to_string),
        children: m
            .get("commands")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_command).collect())
            .unwrap_or_default(),
    })
}

fn parse_sub_query(value: &Value) -> Option<SubQuery> {
    let m = value.as_map()?;
    Some(SubQuery {
        id: m.get("id").and_then(Value::as_i64)?,
        commands: m
            .get("commands")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_command).collect())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trap(method: &str) -> Envelope {
        Envelope::trap(method)
    }

    #[test]
    fn test_parse_channel_id() {
        assert_eq!(parse_channel_id("query-42", QUERY_CHANNEL_PREFIX), Some(42));
        assert_eq!(
            parse_channel_id("query-result-42", RESULT_CHANNEL_PREFIX),
            Some(42)
        );
        // a result channel name never parses as a lifecycle channel
        assert_eq!(parse_channel_id("query-result-42", QUERY_CHANNEL_PREFIX), None);
        assert_eq!(parse_channel_id("other-42", QUERY_CHANNEL_PREFIX), None);
    }

    #[test]
    fn test_lifecycle_eof_ends_query() {
        let q = Query::new(1, "search");
        let t = trap("query-1")
            .with_param("type", "eof")
            .with_param("total_count", 10i64);
        apply_lifecycle_trap(&q, &t, 5);
        assert_eq!(q.status(), QueryStatus::Ended);
        assert_eq!(q.loaded_count(), 10);
    }

    #[test]
    fn test_lifecycle_eof_partial_fetch_is_not_cancellation() {
        let q = Query::new(1, "search");
        let t = trap("query-1")
            .with_param("type", "eof")
            .with_param("total_count", 10i64)
            .with_param("cancel_reason", "partial_fetch");
        apply_lifecycle_trap(&q, &t, 5);
        assert_eq!(q.status(), QueryStatus::Ended);
        assert_eq!(q.cancel_reason(), None);
    }

    #[test]
    fn test_lifecycle_eof_with_cancel_reason() {
        let q = Query::new(1, "search");
        let t = trap("query-1")
            .with_param("type", "eof")
            .with_param("cancel_reason", "server_error")
            .with_param("error_code", 1034i64)
            .with_param("error_detail", "out of disk");
        apply_lifecycle_trap(&q, &t, 5);
        assert_eq!(q.status(), QueryStatus::Cancelled);
        assert_eq!(q.cancel_reason(), Some(CancelReason::ServerError));
        assert_eq!(q.error_code(), Some(1034));
        assert_eq!(q.error_detail().as_deref(), Some("out of disk"));
    }

    #[test]
    fn test_lifecycle_reordered_traps_keep_newest_state() {
        let q = Query::new(42, "search");
        let newer = trap("query-42")
            .with_param("type", "status_change")
            .with_param("status", "Running")
            .with_param("count", 100i64);
        apply_lifecycle_trap(&q, &newer, 10);

        let stale = trap("query-42")
            .with_param("type", "eof")
            .with_param("cancel_reason", "user_request")
            .with_param("total_count", 50i64);
        apply_lifecycle_trap(&q, &stale, 8);

        assert_eq!(q.status(), QueryStatus::Running);
        assert_eq!(q.loaded_count(), 100);
    }

    #[test]
    fn test_status_response_lifecycle_mapping() {
        let running: HashMap<String, Value> = [
            ("rows".to_string(), Value::Int(7)),
            ("is_end".to_string(), Value::Bool(false)),
            ("stamp".to_string(), Value::Int(2)),
        ]
        .into_iter()
        .collect();
        let q = Query::new(1, "search");
        apply_status_response(&q, &running);
        assert_eq!(q.status(), QueryStatus::Running);
        assert_eq!(q.loaded_count(), 7);

        let done: HashMap<String, Value> = [
            ("rows".to_string(), Value::Int(9)),
            ("is_end".to_string(), Value::Bool(true)),
            ("is_eof".to_string(), Value::Bool(true)),
            ("stamp".to_string(), Value::Int(3)),
        ]
        .into_iter()
        .collect();
        apply_status_response(&q, &done);
        assert_eq!(q.status(), QueryStatus::Ended);
        assert_eq!(q.loaded_count(), 9);
    }

    #[test]
    fn test_status_response_stopped_vs_cancelled() {
        let stopped: HashMap<String, Value> = [
            ("is_end".to_string(), Value::Bool(true)),
            ("is_eof".to_string(), Value::Bool(false)),
        ]
        .into_iter()
        .collect();
        let q = Query::new(1, "search");
        apply_status_response(&q, &stopped);
        assert_eq!(q.status(), QueryStatus::Stopped);

        let cancelled: HashMap<String, Value> = [
            ("is_end".to_string(), Value::Bool(true)),
            ("is_eof".to_string(), Value::Bool(true)),
            ("is_cancelled".to_string(), Value::Bool(true)),
            ("stamp".to_string(), Value::Int(9)),
        ]
        .into_iter()
        .collect();
        apply_status_response(&q, &cancelled);
        assert_eq!(q.status(), QueryStatus::Cancelled);
    }

    #[test]
    fn test_parse_result_page_inline() {
        let mut row = Row::new();
        row.insert("line".to_string(), Value::from("hello"));
        let page: HashMap<String, Value> = [
            ("result".to_string(), Value::Array(vec![Value::Map(row)])),
            ("count".to_string(), Value::Int(1)),
            (
                "fields".to_string(),
                Value::Array(vec![Value::from("line")]),
            ),
        ]
        .into_iter()
        .collect();
        let parsed = parse_result_page(&page);
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.total, 1);
        assert_eq!(parsed.fields, Some(vec!["line".to_string()]));
    }

    #[test]
    fn test_parse_command_tree() {
        let inner: HashMap<String, Value> = [
            ("name".to_string(), Value::from("limit")),
            ("status".to_string(), Value::from("Running")),
        ]
        .into_iter()
        .collect();
        let outer: HashMap<String, Value> = [
            ("name".to_string(), Value::from("search")),
            ("status".to_string(), Value::from("Running")),
            ("push_count".to_string(), Value::Int(3)),
            ("commands".to_string(), Value::Array(vec![Value::Map(inner)])),
        ]
        .into_iter()
        .collect();
        let cmd = parse_command(&Value::Map(outer)).unwrap();
        assert_eq!(cmd.name, "search");
        assert_eq!(cmd.push_count, Some(3));
        assert_eq!(cmd.children.len(), 1);
        assert_eq!(cmd.children[0].name, "limit");
    }
}
