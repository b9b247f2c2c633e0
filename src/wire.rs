use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use serde::Serialize;
use tokio::net::TcpStream;

use crate::auth::{TutorflowAuthSource, identity_from_login};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct TutorflowHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TutorflowQueryParser>,
}

impl TutorflowHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TutorflowQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_identity<C: ClientInfo>(&self, client: &C) -> PgWireResult<Identity> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        identity_from_login(&user).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("login user {user:?}: {e}"))
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_identity(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, &actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, actor: &Identity, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRoom(new) => {
                let room = engine.register_room(actor, new).await.map_err(engine_err)?;
                rows(rooms_schema(), [room], room_row)
            }
            Command::SelectRooms(filter) => rows(rooms_schema(), engine.find_rooms(&filter).await, room_row),
            Command::InsertAvailability { tutor_id, start, end } => {
                engine
                    .add_availability(actor, &tutor_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSessions(batch) => {
                let mut created = Vec::with_capacity(batch.len());
                for new in batch {
                    created.push(engine.create_session(actor, new).await.map_err(engine_err)?);
                }
                rows(sessions_schema(), created, session_row)
            }
            Command::InsertSessionStatus { session_id, status } => {
                let session = engine
                    .transition_session(actor, session_id, status)
                    .await
                    .map_err(engine_err)?;
                rows(sessions_schema(), [session], session_row)
            }
            Command::SelectSessions(filter) => {
                rows(sessions_schema(), engine.list_sessions(&filter).await, session_row)
            }
            Command::InsertChangeRequest(insert) => {
                let new = insert.into_request().map_err(engine_err)?;
                let request = engine.create_change_request(actor, new).await.map_err(engine_err)?;
                rows(requests_schema(), [request], request_row)
            }
            Command::SelectChangeRequests(filter) => {
                rows(requests_schema(), engine.list_change_requests(&filter).await, request_row)
            }
            Command::InsertReview(review) => {
                let request = engine.review(actor, review).await.map_err(engine_err)?;
                rows(requests_schema(), [request], request_row)
            }
            Command::InsertClarificationResponse { request_id, response } => {
                let request = engine
                    .respond_to_clarification(actor, request_id, &response)
                    .await
                    .map_err(engine_err)?;
                rows(requests_schema(), [request], request_row)
            }
            Command::SelectConflicts {
                tutor_id,
                start,
                end,
                exclude,
            } => {
                let hit = engine
                    .has_conflict(&tutor_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                rows(conflicts_schema(), [hit], conflict_row)
            }
            Command::SelectSlots {
                tutor_id,
                start,
                end,
                min_duration,
            } => {
                let slots = engine
                    .available_slots(&tutor_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                rows(slots_schema(), slots.into_iter().map(|s| (tutor_id.as_str(), s)), slot_row)
            }
            Command::SelectOptimizationPlan { focus, constraints } => {
                let plan = engine
                    .generate_optimization_plan(actor, &focus, constraints)
                    .await
                    .map_err(engine_err)?;
                let impact = serde_json::json!({
                    "roomReallocations": plan.impact.room_reallocations,
                    "tutorReassignments": plan.impact.tutor_reassignments,
                    "groupAdjustments": plan.impact.group_adjustments,
                    "scheduleAdjustments": plan.impact.schedule_adjustments,
                    "tutorsAffected": plan.impact.tutors_affected,
                    "minutesMoved": plan.impact.minutes_moved,
                })
                .to_string();
                let plan_id = plan.id.to_string();
                rows(
                    plan_schema(),
                    plan.changes.iter().enumerate().map(|(i, c)| (plan_id.as_str(), i, c, impact.as_str())),
                    plan_row,
                )
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("floor", Type::INT4),
        field("capacity", Type::INT8),
        field("equipment", Type::VARCHAR),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tutor_id", Type::VARCHAR),
        field("student_ids", Type::VARCHAR),
        field("subject", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("mode", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("meeting_link", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("equipment", Type::VARCHAR),
        field("class_id", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("group_limit", Type::INT8),
        field("split_from", Type::VARCHAR),
        field("merged_from", Type::VARCHAR),
        field("superseded_by", Type::VARCHAR),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("proposer", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("priority", Type::VARCHAR),
        field("target_id", Type::VARCHAR),
        field("change_type", Type::VARCHAR),
        field("change_data", Type::VARCHAR),
        field("requires_room", Type::BOOL),
        field("reviewer", Type::VARCHAR),
        field("review_notes", Type::VARCHAR),
        field("approved_location", Type::VARCHAR),
        field("clarification_request", Type::VARCHAR),
        field("clarification_response", Type::VARCHAR),
        field("deadline", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("resolved_at", Type::INT8),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("conflict", Type::BOOL),
        field("session_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("tutor_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn plan_schema() -> Vec<FieldInfo> {
    vec![
        field("plan_id", Type::VARCHAR),
        field("idx", Type::INT8),
        field("resource_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("from_value", Type::VARCHAR),
        field("to_value", Type::VARCHAR),
        field("rationale", Type::VARCHAR),
        field("change", Type::VARCHAR),
        field("impact", Type::VARCHAR),
    ]
}

/// Result schema a statement will produce, judged from the table it names.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let table = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|t| !t.is_empty())
        .skip_while(|t| *t != "FROM" && *t != "INTO")
        .nth(1)
        .map(|t| t.trim_matches('"').rsplit('.').next().unwrap_or_default().to_string());
    match table.as_deref() {
        Some("ROOMS") => rooms_schema(),
        Some("SESSIONS" | "SESSION_STATUS") => sessions_schema(),
        Some("CHANGE_REQUESTS" | "REVIEWS" | "CLARIFICATION_RESPONSES") => requests_schema(),
        Some("CONFLICTS") => conflicts_schema(),
        Some("SLOTS") => slots_schema(),
        Some("OPTIMIZATION_PLAN") => plan_schema(),
        _ => vec![],
    }
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(encoded))))
}

fn json<T: Serialize>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| user_error("XX000", format!("encoding row: {e}")))
}

fn ids(list: &[ulid::Ulid]) -> String {
    list.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn room_row(enc: &mut DataRowEncoder, room: Room) -> PgWireResult<()> {
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.name)?;
    enc.encode_field(&room.building)?;
    enc.encode_field(&room.floor)?;
    enc.encode_field(&i64::from(room.capacity))?;
    enc.encode_field(&format_equipment(&room.equipment))
}

fn session_row(enc: &mut DataRowEncoder, s: Session) -> PgWireResult<()> {
    enc.encode_field(&s.id.to_string())?;
    enc.encode_field(&s.tutor_id)?;
    enc.encode_field(&s.student_ids.join(","))?;
    enc.encode_field(&s.subject)?;
    enc.encode_field(&s.span.start)?;
    enc.encode_field(&s.span.end)?;
    enc.encode_field(&s.mode.as_str())?;
    enc.encode_field(&s.location)?;
    enc.encode_field(&s.meeting_link)?;
    enc.encode_field(&s.status.as_str())?;
    enc.encode_field(&format_equipment(&s.equipment))?;
    enc.encode_field(&s.class_id)?;
    enc.encode_field(&s.notes)?;
    enc.encode_field(&s.group_limit.map(i64::from))?;
    enc.encode_field(&s.split_from.map(|u| u.to_string()))?;
    enc.encode_field(&ids(&s.merged_from))?;
    enc.encode_field(&s.superseded_by.map(|u| u.to_string()))
}

fn request_row(enc: &mut DataRowEncoder, r: ChangeRequest) -> PgWireResult<()> {
    let change_data = match &r.payload {
        RequestPayload::SessionChange { change, .. } => json(change)?,
        RequestPayload::ResourceAllocation { changes } => json(changes)?,
    };
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.kind().as_str())?;
    enc.encode_field(&r.status.as_str())?;
    enc.encode_field(&r.proposer)?;
    enc.encode_field(&r.title)?;
    enc.encode_field(&r.description)?;
    enc.encode_field(&r.priority.as_str())?;
    enc.encode_field(&r.target_session().map(|u| u.to_string()))?;
    enc.encode_field(&r.change_type())?;
    enc.encode_field(&change_data)?;
    enc.encode_field(&r.requires_room())?;
    enc.encode_field(&r.reviewer)?;
    enc.encode_field(&r.review_notes)?;
    enc.encode_field(&r.approved_location)?;
    enc.encode_field(&r.clarification_request)?;
    enc.encode_field(&r.clarification_response)?;
    enc.encode_field(&r.deadline)?;
    enc.encode_field(&r.created_at)?;
    enc.encode_field(&r.updated_at)?;
    enc.encode_field(&r.resolved_at)
}

fn conflict_row(enc: &mut DataRowEncoder, hit: Option<ConflictReport>) -> PgWireResult<()> {
    enc.encode_field(&hit.is_some())?;
    enc.encode_field(&hit.as_ref().map(|c| c.session_id.to_string()))?;
    enc.encode_field(&hit.as_ref().map(|c| c.span.start))?;
    enc.encode_field(&hit.as_ref().map(|c| c.span.end))
}

fn slot_row(enc: &mut DataRowEncoder, (tutor_id, slot): (&str, Span)) -> PgWireResult<()> {
    enc.encode_field(&tutor_id)?;
    enc.encode_field(&slot.start)?;
    enc.encode_field(&slot.end)
}

fn plan_row(
    enc: &mut DataRowEncoder,
    (plan_id, idx, change, impact): (&str, usize, &AllocationChange, &str),
) -> PgWireResult<()> {
    enc.encode_field(&plan_id)?;
    enc.encode_field(&(idx as i64))?;
    enc.encode_field(&change.resource_id.to_string())?;
    enc.encode_field(&change.kind.as_str())?;
    enc.encode_field(&change.from)?;
    enc.encode_field(&change.to)?;
    enc.encode_field(&change.rationale)?;
    enc.encode_field(&json(change)?)?;
    enc.encode_field(&impact)
}

#[async_trait]
impl SimpleQueryHandler for TutorflowHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TutorflowQueryParser;

#[async_trait]
impl QueryParser for TutorflowQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TutorflowHandler {
    type Statement = String;
    type QueryParser = TutorflowQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest $N placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... with the bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
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

pub struct TutorflowFactory {
    handler: Arc<TutorflowHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<TutorflowAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TutorflowFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TutorflowAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TutorflowHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TutorflowFactory {
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
    let factory = Arc::new(TutorflowFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    tracing::debug!(kind = e.kind().label(), "request refused: {e}");
    user_error(e.kind().sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_counted() {
        assert_eq!(count_params("SELECT * FROM sessions"), 0);
        assert_eq!(count_params("INSERT INTO reviews VALUES ($1, $2, $10)"), 10);
    }

    #[test]
    fn schema_follows_named_table() {
        assert_eq!(schema_for("select * from rooms where capacity >= $1").len(), 6);
        assert_eq!(schema_for("INSERT INTO reviews (request_id, decision) VALUES ($1, $2)").len(), 20);
        assert_eq!(schema_for("SELECT * FROM \"slots\" WHERE tutor_id = 't'").len(), 3);
        assert!(schema_for("INSERT INTO availability VALUES ('t', 1, 2)").is_empty());
    }
}
