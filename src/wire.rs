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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdAuthSource;
use crate::engine::{Buckets, Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ResultSet, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// Parse, execute and meter a single statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(crate::observability::PARSE_ERRORS_TOTAL).increment(1);
            tracing::debug!(error = %e, "rejected statement");
            sql_err(e)
        })?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                tracing::debug!(command = label, error = %e, "command failed");
                "error"
            }
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser { email, name } => {
                let user = engine.create_user(&email, &name).await?;
                Ok(users_response(&[user], format))
            }
            Command::SelectUsers { id: None } => Ok(users_response(&engine.list_users(), format)),
            Command::SelectUsers { id: Some(id) } => {
                let user = engine.get_user(id)?;
                Ok(users_response(&[user], format))
            }
            Command::InsertSlot {
                user_id,
                start,
                duration_minutes,
            } => {
                let slot = engine.create_slot(user_id, start, duration_minutes).await?;
                Ok(slot_response(&slot, format))
            }
            Command::SelectSlots {
                user_id,
                from,
                to,
                status,
                page,
            } => {
                let page = engine.query_slots(user_id, from, to, status, page).await?;
                Ok(slot_page_response(&page, format))
            }
            Command::SelectSlot { user_id, slot_id } => {
                let slot = engine.get_slot(user_id, slot_id).await?;
                Ok(slot_page_response(
                    &Page {
                        items: vec![slot],
                        page: 0,
                        size: 1,
                        total_items: 1,
                        total_pages: 1,
                    },
                    format,
                ))
            }
            Command::RescheduleSlot {
                user_id,
                slot_id,
                start,
                end,
                expected_version,
            } => {
                let slot = engine
                    .modify_slot_times(user_id, slot_id, start, end, expected_version)
                    .await?;
                Ok(slot_response(&slot, format))
            }
            Command::SetSlotStatus {
                user_id,
                slot_id,
                status,
                expected_version,
            } => {
                let slot = engine
                    .set_slot_status(user_id, slot_id, status, expected_version)
                    .await?;
                Ok(slot_response(&slot, format))
            }
            Command::DeleteSlot {
                user_id,
                slot_id,
                expected_version,
            } => {
                engine.delete_slot(user_id, slot_id, expected_version).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertMeeting {
                user_id,
                slot_id,
                title,
                description,
                participants,
                expected_version,
            } => {
                let meeting = engine
                    .schedule_meeting(
                        user_id,
                        slot_id,
                        &title,
                        description.as_deref(),
                        &participants,
                        expected_version,
                    )
                    .await?;
                Ok(meeting_response(&meeting, format))
            }
            Command::SelectFreeBusy { user_id, from, to } => {
                let fb = engine.free_busy(user_id, from, to).await?;
                Ok(free_busy_response(&fb, format))
            }
            Command::SelectBuckets {
                user_id,
                from,
                to,
                granularity_ms,
            } => {
                let buckets = engine.bucketed_availability(user_id, from, to, granularity_ms)?;
                Ok(buckets_response(&buckets, format))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

type Column = (&'static str, Type);

fn int8(name: &'static str) -> Column {
    (name, Type::INT8)
}

fn varchar(name: &'static str) -> Column {
    (name, Type::VARCHAR)
}

/// Columns of `result_set`, each in the wire format the client asked for.
fn schema_for(result_set: ResultSet, format: &Format) -> Vec<FieldInfo> {
    columns(result_set)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(name.into(), None, None, ty, format.format_for(idx))
        })
        .collect()
}

fn columns(result_set: ResultSet) -> Vec<Column> {
    match result_set {
        ResultSet::Users => vec![int8("id"), varchar("email"), varchar("name")],
        ResultSet::Slot => slot_fields(),
        ResultSet::SlotPage => {
            let mut fields = slot_fields();
            fields.extend([int8("total_items"), int8("total_pages")]);
            fields
        }
        ResultSet::Meeting => vec![
            int8("id"),
            int8("slot_id"),
            varchar("title"),
            varchar("description"),
            varchar("participant_user_ids"),
        ],
        ResultSet::FreeBusy => vec![varchar("kind"), int8("start"), int8("end")],
        ResultSet::Buckets => vec![int8("start"), int8("end")],
    }
}

fn slot_fields() -> Vec<Column> {
    vec![
        int8("id"),
        int8("calendar_id"),
        int8("start"),
        int8("end"),
        varchar("status"),
        int8("meeting_id"),
        int8("version"),
    ]
}

/// INT8 columns are signed; ids and versions never approach the limit.
fn signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn rows_response<T>(
    result_set: ResultSet,
    format: &Format,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema_for(result_set, format));
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&signed(slot.id))?;
    encoder.encode_field(&signed(slot.calendar_id))?;
    encoder.encode_field(&slot.span.start)?;
    encoder.encode_field(&slot.span.end)?;
    encoder.encode_field(&slot.status.to_string())?;
    encoder.encode_field(&slot.meeting_id.map(signed))?;
    encoder.encode_field(&signed(slot.version))
}

fn users_response(users: &[User], format: &Format) -> Response {
    rows_response(ResultSet::Users, format, users, |encoder, user| {
        encoder.encode_field(&signed(user.id))?;
        encoder.encode_field(&user.email)?;
        encoder.encode_field(&user.name)
    })
}

fn slot_response(slot: &Slot, format: &Format) -> Response {
    rows_response(ResultSet::Slot, format, [slot], encode_slot)
}

fn slot_page_response(page: &Page<Slot>, format: &Format) -> Response {
    let total_items = page.total_items as i64;
    let total_pages = page.total_pages as i64;
    rows_response(ResultSet::SlotPage, format, &page.items, |encoder, slot| {
        encode_slot(encoder, slot)?;
        encoder.encode_field(&total_items)?;
        encoder.encode_field(&total_pages)
    })
}

fn meeting_response(meeting: &MeetingInfo, format: &Format) -> Response {
    rows_response(ResultSet::Meeting, format, [meeting], |encoder, meeting| {
        let participants = serde_json::to_string(&meeting.participant_user_ids)
            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
        encoder.encode_field(&signed(meeting.id))?;
        encoder.encode_field(&signed(meeting.slot_id))?;
        encoder.encode_field(&meeting.title)?;
        encoder.encode_field(&meeting.description)?;
        encoder.encode_field(&participants)
    })
}

/// Busy and free intervals interleaved in start order.
fn free_busy_response(fb: &FreeBusy, format: &Format) -> Response {
    let mut spans: Vec<(&str, Span)> = fb
        .busy
        .iter()
        .map(|s| (SlotStatus::Busy.as_str(), *s))
        .chain(fb.free.iter().map(|s| (SlotStatus::Free.as_str(), *s)))
        .collect();
    spans.sort_by_key(|(_, span)| span.start);
    rows_response(ResultSet::FreeBusy, format, spans, |encoder, (kind, span)| {
        encoder.encode_field(&kind.to_string())?;
        encoder.encode_field(&span.start)?;
        encoder.encode_field(&span.end)
    })
}

fn buckets_response(buckets: &Buckets, format: &Format) -> Response {
    rows_response(ResultSet::Buckets, format, buckets, |encoder, span| {
        encoder.encode_field(&span.start)?;
        encoder.encode_field(&span.end)
    })
}

fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::result_set(sql)
        .map(|rs| schema_for(rs, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, &Format::UnifiedText),
        ))
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Byte ranges of `$N` placeholders outside quoted literals and identifiers,
/// with their 1-based index.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote reads as closing then reopening, which lands
            // back inside the literal.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start + 1..end].parse::<usize>() {
                    found.push((start..end, n));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Inline bound parameters as quoted text in one pass over the original
/// statement, so inlined values are never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|idx| params.get(idx)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::OwnershipViolation { .. } => "42501",
        EngineError::OverlapConflict(_) => "23P01",
        EngineError::InvalidArgument(_) => "22023",
        EngineError::ConcurrentModification { .. } => "40001",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
