use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::auth::CourtbookAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

/// Handler for one client connection. Court events on channels the client
/// LISTENs to are queued and delivered the next time it sends a query.
pub struct CourtbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CourtbookQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl CourtbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CourtbookQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, engine: &Engine, channel: String, court_id: Ulid) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        if subs.iter().any(|s| s.channel == channel) {
            return;
        }
        subs.push(Subscription {
            channel,
            rx: engine.notify.subscribe(court_id),
        });
    }

    /// Drain every queued event. Subscriptions whose court is gone are dropped.
    fn take_notifications(&self) -> Vec<NotificationResponse> {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        subs.retain_mut(|sub| loop {
            match sub.rx.try_recv() {
                Ok(event) => out.push(NotificationResponse::new(0, sub.channel.clone(), notify::payload(&event))),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!("listener on {} missed {missed} events", sub.channel);
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    async fn send_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for n in self.take_notifications() {
            client.send(PgWireBackendMessage::NotificationResponse(n)).await?;
        }
        Ok(())
    }

    /// One engine per database name; each database is a venue.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("venue error: {e}")))
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SetConfig { config } => {
                engine.set_config(config).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectConfig => {
                let config = engine
                    .current_config()
                    .await
                    .map_err(|e| engine_err(e.into()))?;
                let schema = Arc::new(config_schema());
                let rows = vec![encode_config(&schema, &config)];
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertCourt { id, name } => {
                engine.create_court(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteCourt { id } => {
                engine.delete_court(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectCourts => {
                let schema = Arc::new(courts_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_courts()
                    .await
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&(c.active_reservations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertReservation { reservation } => {
                engine
                    .place_reservation(reservation, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertReservations { reservations } => {
                let placed = engine
                    .place_reservations(reservations, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(placed.len()))])
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ConfirmReservation { id } => {
                engine.confirm_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectReservations { court_id, date } => {
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .get_reservations(court_id, date)
                    .await
                    .iter()
                    .map(|r| encode_reservation(&schema, r))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSlots { court_id, date, as_of } => {
                let now = as_of.unwrap_or_else(|| chrono::Local::now().naive_local());
                let slots = engine
                    .day_slots(court_id, date, now)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.start_time.to_string())?;
                        encoder.encode_field(&s.end_time.to_string())?;
                        encoder.encode_field(&s.available)?;
                        encoder.encode_field(&s.is_peak_hour)?;
                        encoder.encode_field(&s.price.to_string())?;
                        encoder.encode_field(&block_reason_label(s.block_reason))?;
                        encoder.encode_field(&s.is_popular)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectRecurrencePreview { rule } => {
                let preview = engine.recurrence_preview(&rule).await.map_err(engine_err)?;
                let schema = Arc::new(recurrence_schema());
                let total = preview.total_count as i64;
                let available = preview.available_count as i64;
                let rows: Vec<PgWireResult<DataRow>> = preview
                    .entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.date.to_string())?;
                        encoder.encode_field(&e.start_time.to_string())?;
                        encoder.encode_field(&e.end_time.to_string())?;
                        encoder.encode_field(&e.available)?;
                        encoder.encode_field(&total)?;
                        encoder.encode_field(&available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertRecurrence { rule, payment_method_id, total_amount } => {
                let created = engine
                    .confirm_recurrence(&rule, payment_method_id, total_amount, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(created.len()))])
            }
            Command::SelectPeakHours { court_id, date } => {
                let analysis = engine.peak_hours(court_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(peak_hours_schema());
                let week_start = analysis.week_start.to_string();
                let week_end = analysis.week_end.to_string();
                let rows: Vec<PgWireResult<DataRow>> = analysis
                    .top_start_times
                    .iter()
                    .enumerate()
                    .map(|(i, t)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&week_start)?;
                        encoder.encode_field(&week_end)?;
                        encoder.encode_field(&(i as i32 + 1))?;
                        encoder.encode_field(&t.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::Listen { channel } => {
                let court_id = notify::parse_channel(&channel).ok_or_else(|| {
                    user_error("42000", format!("invalid channel: {channel} (expected court_{{id}})"))
                })?;
                self.subscribe(engine, channel, court_id);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn block_reason_label(reason: BlockReason) -> &'static str {
    match reason {
        BlockReason::None => "none",
        BlockReason::Reserved => "reserved",
        BlockReason::PastCutoff => "pastCutoff",
    }
}

fn encode_config(schema: &Arc<Vec<FieldInfo>>, c: &BusinessConfig) -> PgWireResult<DataRow> {
    let peak_hours = c
        .peak_hour_windows
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&c.opening_time.to_string())?;
    encoder.encode_field(&c.closing_time.to_string())?;
    encoder.encode_field(&c.standard_rate.to_string())?;
    encoder.encode_field(&c.peak_rate.map(|m| m.to_string()))?;
    encoder.encode_field(&(c.peak_rate_percentage as i64))?;
    encoder.encode_field(&(c.min_lead_minutes as i64))?;
    encoder.encode_field(&peak_hours)?;
    Ok(encoder.take_row())
}

fn encode_reservation(schema: &Arc<Vec<FieldInfo>>, r: &Reservation) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.court_id.to_string())?;
    encoder.encode_field(&r.date.to_string())?;
    encoder.encode_field(&r.start_time.to_string())?;
    encoder.encode_field(&r.end_time.to_string())?;
    encoder.encode_field(&r.status.as_str())?;
    encoder.encode_field(&r.sport_id)?;
    encoder.encode_field(&r.payment_method_id)?;
    encoder.encode_field(&r.total_amount.to_string())?;
    encoder.encode_field(&r.payment_deadline)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn config_schema() -> Vec<FieldInfo> {
    vec![
        text_field("opening_time"),
        text_field("closing_time"),
        text_field("standard_rate"),
        text_field("peak_rate"),
        typed_field("peak_rate_percentage", Type::INT8),
        typed_field("min_lead_minutes", Type::INT8),
        text_field("peak_hours"),
    ]
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        typed_field("active_reservations", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("court_id"),
        text_field("booking_date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("sport_id"),
        text_field("payment_method_id"),
        text_field("total_amount"),
        typed_field("payment_deadline", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time"),
        text_field("end_time"),
        typed_field("available", Type::BOOL),
        typed_field("is_peak_hour", Type::BOOL),
        text_field("price"),
        text_field("block_reason"),
        typed_field("is_popular", Type::BOOL),
    ]
}

fn recurrence_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_date"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("available", Type::BOOL),
        typed_field("total_count", Type::INT8),
        typed_field("available_count", Type::INT8),
    ]
}

fn peak_hours_schema() -> Vec<FieldInfo> {
    vec![
        text_field("week_start"),
        text_field("week_end"),
        typed_field("rank", Type::INT4),
        text_field("start_time"),
    ]
}

/// Result columns of a statement, judged from its text so that statements
/// with unbound `$n` parameters can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let from = |table: &str| lower.contains(&format!("from {table}"));
    if from("slots") {
        slots_schema()
    } else if from("recurrence_preview") {
        recurrence_schema()
    } else if from("peak_hours") {
        peak_hours_schema()
    } else if from("reservations") {
        reservations_schema()
    } else if from("courts") {
        courts_schema()
    } else if from("config") {
        config_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = self.run(&engine, query).await;
        self.send_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtbookQueryParser;

#[async_trait]
impl QueryParser for CourtbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtbookHandler {
    type Statement = String;
    type QueryParser = CourtbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let result = self.run(&engine, &sql).await;
        self.send_notifications(client).await?;
        let mut responses = result?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.swap_remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text-format parameters as quoted literals. Highest index
/// first so that `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtbookFactory {
    handler: Arc<CourtbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CourtbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(CourtbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CourtbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CourtbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        // object_not_in_prerequisite_state
        EngineError::Config(_) => "55000",
        // invalid_parameter_value
        EngineError::Validation(_) => "22023",
        // unique_violation
        EngineError::SlotTaken(_) | EngineError::Conflict(_) => "23505",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_bad_value() { "22023" } else { "42601" };
    user_error(code, e.to_string())
}
