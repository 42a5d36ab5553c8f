use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::FitbookAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};
use crate::tenant::TenantManager;

pub struct FitbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FitbookQueryParser>,
}

impl FitbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FitbookQueryParser),
        }
    }

    /// One gym per database name.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one command, recording latency and outcome.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::UpsertFacility {
                id,
                name,
                allows_reservations,
                session_minutes,
                capacity,
            } => {
                // Weekly hours survive an upsert; only the scalar settings change.
                let mut config = match engine.facility(id).await {
                    Ok(existing) => existing,
                    Err(EngineError::FacilityNotFound) => {
                        FacilityScheduleConfig::new(id, session_minutes, capacity)
                    }
                    Err(e) => return Err(engine_err(e)),
                };
                config.name = name;
                config.allows_user_reservations = allows_reservations;
                config.session_minutes = session_minutes;
                config.max_per_slot = capacity;
                engine.configure_facility(config).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SetFacilityHours { facility_id, hours } => {
                engine
                    .set_facility_hours(facility_id, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DefinePlan { plan } => {
                engine.define_plan(plan).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::RegisterMember { id, name } => {
                engine.register_member(id, name).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SetAllowance {
                member_id,
                allowed,
                used,
            } => {
                engine
                    .set_allowance(member_id, allowed, used)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertReservation {
                member_id,
                facility_id,
                request,
            } => {
                let reservation = engine
                    .create_reservation(member_id, facility_id, request)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![reservation])
            }
            Command::CancelReservation { id, member_id } => {
                engine
                    .cancel_reservation(member_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertGrant {
                id,
                member_id,
                plan_id,
                overrides,
            } => {
                let grant = match plan_id {
                    Some(plan_id) => engine.issue_grant(id, member_id, plan_id, overrides).await,
                    None => engine.renew_grant(id, member_id, overrides).await,
                }
                .map_err(engine_err)?;
                grant_rows(vec![grant])
            }
            Command::InvalidateGrant { id, member_id } => {
                engine
                    .invalidate_grant(member_id, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ExtendGrant {
                grant_id,
                extra_days,
            } => {
                let grant = engine
                    .extend_grant(grant_id, extra_days)
                    .await
                    .map_err(engine_err)?;
                grant_rows(vec![grant])
            }
            Command::SelectAvailability {
                facility_id,
                weekday,
                date,
            } => {
                let slots = engine
                    .get_available_slots(weekday, facility_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schema_for(RowShape::Availability));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.slot.start.to_string())?;
                        encoder.encode_field(&s.slot.end.to_string())?;
                        encoder.encode_field(&s.is_available)?;
                        encoder.encode_field(&i64::from(s.current_reservations))?;
                        encoder.encode_field(&i64::from(s.max_reservations))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations { member_id } => {
                let rows = engine
                    .member_reservations(member_id)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(rows)
            }
            Command::SelectActiveGrants { member_id } => {
                let grants = engine.has_active_grant(member_id).await.map_err(engine_err)?;
                grant_rows(grants)
            }
            Command::SelectGrants { member_id } => {
                let grants = engine.grant_history(member_id).await.map_err(engine_err)?;
                grant_rows(grants)
            }
            Command::SelectMember { id } => {
                let member = engine.member(id).await.map_err(engine_err)?;
                let expired = engine.is_expired(id).await.map_err(engine_err)?;
                let schema = Arc::new(schema_for(RowShape::Member));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&member.id.to_string())?;
                encoder.encode_field(&member.name)?;
                encoder.encode_field(&i64::from(member.allowed_reservations))?;
                encoder.encode_field(&i64::from(member.used_reservations))?;
                encoder.encode_field(&expired)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn timestamp(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn reservation_rows(rows: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(RowShape::Reservation));
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.member_id.to_string())?;
            encoder.encode_field(&r.facility_id.to_string())?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&r.slot.start.to_string())?;
            encoder.encode_field(&r.slot.end.to_string())?;
            encoder.encode_field(&r.weekday.to_string())?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&timestamp(r.created_at))?;
            encoder.encode_field(&timestamp(r.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn grant_rows(grants: Vec<EntitlementGrant>) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(RowShape::Grant));
    let rows: Vec<PgWireResult<_>> = grants
        .into_iter()
        .map(|g| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&g.id.to_string())?;
            encoder.encode_field(&g.member_id.to_string())?;
            encoder.encode_field(&g.plan_id.to_string())?;
            encoder.encode_field(&timestamp(g.start_date))?;
            encoder.encode_field(&timestamp(g.end_date))?;
            encoder.encode_field(&g.payment_state.as_str().to_string())?;
            encoder.encode_field(&(g.paid_amount as i64))?;
            encoder.encode_field(&(g.original_amount as i64))?;
            encoder.encode_field(&g.paid_at.map(timestamp))?;
            encoder.encode_field(&g.invalidated_at.map(timestamp))?;
            encoder.encode_field(&timestamp(g.created_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema_for(shape: RowShape) -> Vec<FieldInfo> {
    match shape {
        RowShape::Availability => vec![
            field("start_time", Type::VARCHAR),
            field("end_time", Type::VARCHAR),
            field("is_available", Type::BOOL),
            field("current_reservations", Type::INT8),
            field("max_reservations", Type::INT8),
        ],
        RowShape::Reservation => vec![
            field("id", Type::VARCHAR),
            field("member_id", Type::VARCHAR),
            field("facility_id", Type::VARCHAR),
            field("date", Type::VARCHAR),
            field("start_time", Type::VARCHAR),
            field("end_time", Type::VARCHAR),
            field("weekday", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("notes", Type::VARCHAR),
            field("created_at", Type::VARCHAR),
            field("updated_at", Type::VARCHAR),
        ],
        RowShape::Grant => vec![
            field("id", Type::VARCHAR),
            field("member_id", Type::VARCHAR),
            field("plan_id", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
            field("payment_state", Type::VARCHAR),
            field("paid_amount", Type::INT8),
            field("original_amount", Type::INT8),
            field("paid_at", Type::VARCHAR),
            field("invalidated_at", Type::VARCHAR),
            field("created_at", Type::VARCHAR),
        ],
        RowShape::Member => vec![
            field("id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("allowed_reservations", Type::INT8),
            field("used_reservations", Type::INT8),
            field("expired", Type::BOOL),
        ],
    }
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::row_shape(sql).map(schema_for).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for FitbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FitbookQueryParser;

#[async_trait]
impl QueryParser for FitbookQueryParser {
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
impl ExtendedQueryHandler for FitbookHandler {
    type Statement = String;
    type QueryParser = FitbookQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
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

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FitbookFactory {
    handler: Arc<FitbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<FitbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FitbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FitbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FitbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FitbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FitbookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::BadRequest => "P0001",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind() == ErrorKind::Internal {
        tracing::error!("engine failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(e.kind()).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
