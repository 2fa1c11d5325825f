use chrono::DateTime;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        email: String,
        name: String,
    },
    SelectUsers {
        id: Option<Id>,
    },
    InsertSlot {
        user_id: Id,
        start: Ms,
        duration_minutes: i64,
    },
    SelectSlots {
        user_id: Id,
        from: Ms,
        to: Ms,
        status: Option<SlotStatus>,
        page: PageRequest,
    },
    SelectSlot {
        user_id: Id,
        slot_id: Id,
    },
    RescheduleSlot {
        user_id: Id,
        slot_id: Id,
        start: Ms,
        end: Ms,
        expected_version: Option<u64>,
    },
    SetSlotStatus {
        user_id: Id,
        slot_id: Id,
        status: SlotStatus,
        expected_version: Option<u64>,
    },
    DeleteSlot {
        user_id: Id,
        slot_id: Id,
        expected_version: Option<u64>,
    },
    InsertMeeting {
        user_id: Id,
        slot_id: Id,
        title: String,
        description: Option<String>,
        participants: Vec<Id>,
        expected_version: Option<u64>,
    },
    SelectFreeBusy {
        user_id: Id,
        from: Ms,
        to: Ms,
    },
    SelectBuckets {
        user_id: Id,
        from: Ms,
        to: Ms,
        granularity_ms: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape a statement produces, decided from its kind and table alone so
/// it works on unbound statements (`$n` placeholders) during Describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Users,
    Slot,
    SlotPage,
    Meeting,
    FreeBusy,
    Buckets,
}

pub fn result_set(sql: &str) -> Option<ResultSet> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => match insert_table_name(insert).ok()?.as_str() {
            "users" => Some(ResultSet::Users),
            "slots" => Some(ResultSet::Slot),
            "meetings" => Some(ResultSet::Meeting),
            _ => None,
        },
        Statement::Update { table, .. } => {
            (table_factor_name(&table.relation).ok()? == "slots").then_some(ResultSet::Slot)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "users" => Some(ResultSet::Users),
                "slots" => Some(ResultSet::SlotPage),
                "free_busy" => Some(ResultSet::FreeBusy),
                "buckets" => Some(ResultSet::Buckets),
                _ => None,
            }
        }
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column → value pairs of the first VALUES row. Without a column list the
/// table's default column order applies.
struct InsertRow {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl InsertRow {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const USER_COLUMNS: &[&str] = &["email", "name"];
const SLOT_COLUMNS: &[&str] = &["user_id", "start", "duration_minutes"];
const MEETING_COLUMNS: &[&str] = &[
    "user_id",
    "slot_id",
    "title",
    "description",
    "participants",
    "version",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "users" => ("users", USER_COLUMNS),
        "slots" => ("slots", SLOT_COLUMNS),
        "meetings" => ("meetings", MEETING_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, table, defaults)?;

    match table {
        "users" => Ok(Command::InsertUser {
            email: parse_string(row.require("email")?)?,
            name: parse_string(row.require("name")?)?,
        }),
        "slots" => Ok(Command::InsertSlot {
            user_id: parse_id(row.require("user_id")?)?,
            start: parse_timestamp(row.require("start")?)?,
            duration_minutes: parse_i64(row.require("duration_minutes")?)?,
        }),
        _ => Ok(Command::InsertMeeting {
            user_id: parse_id(row.require("user_id")?)?,
            slot_id: parse_id(row.require("slot_id")?)?,
            title: parse_string(row.require("title")?)?,
            description: row.get("description").map(parse_string_or_null).transpose()?.flatten(),
            participants: parse_id_list(row.require("participants")?)?,
            expected_version: row.get("version").map(parse_version_or_null).transpose()?.flatten(),
        }),
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<InsertRow, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if !insert.columns.is_empty() && values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    Ok(InsertRow {
        table,
        fields: columns.into_iter().zip(values).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }

    let (mut start, mut end, mut status) = (None, None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "start" => start = Some(parse_timestamp(&assignment.value)?),
            "end" => end = Some(parse_timestamp(&assignment.value)?),
            "status" => status = Some(parse_status(&assignment.value)?),
            _ => return Err(SqlError::UnknownColumn("slots", column)),
        }
    }

    let filters = Filters::from_selection(selection)?;
    let slot_id = filters.require_id("id")?;
    let user_id = filters.require_id("user_id")?;
    let expected_version = filters.version()?;

    match (start, end, status) {
        (Some(start), Some(end), None) => Ok(Command::RescheduleSlot {
            user_id,
            slot_id,
            start,
            end,
            expected_version,
        }),
        (None, None, Some(status)) => Ok(Command::SetSlotStatus {
            user_id,
            slot_id,
            status,
            expected_version,
        }),
        (None, None, None) => Err(SqlError::Parse("UPDATE without SET".into())),
        (_, _, Some(_)) => Err(SqlError::Unsupported(
            "status and times cannot be updated together".into(),
        )),
        _ => Err(SqlError::Parse(
            "both start and \"end\" must be set to reschedule".into(),
        )),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    Ok(Command::DeleteSlot {
        user_id: filters.require_id("user_id")?,
        slot_id: filters.require_id("id")?,
        expected_version: filters.version()?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "users" => Ok(Command::SelectUsers {
            id: filters.optional(BinaryOperator::Eq, "id").map(parse_id).transpose()?,
        }),
        "slots" => {
            let user_id = filters.require_id("user_id")?;
            if let Some(slot_id) = filters.optional(BinaryOperator::Eq, "id") {
                return Ok(Command::SelectSlot {
                    user_id,
                    slot_id: parse_id(slot_id)?,
                });
            }
            Ok(Command::SelectSlots {
                user_id,
                from: parse_timestamp(filters.require(BinaryOperator::GtEq, "start")?)?,
                to: parse_timestamp(filters.require(BinaryOperator::Lt, "start")?)?,
                status: filters
                    .optional(BinaryOperator::Eq, "status")
                    .map(parse_status)
                    .transpose()?,
                page: filters.page_request()?,
            })
        }
        "free_busy" => Ok(Command::SelectFreeBusy {
            user_id: filters.require_id("user_id")?,
            from: parse_timestamp(filters.require(BinaryOperator::GtEq, "start")?)?,
            to: parse_timestamp(filters.require(BinaryOperator::LtEq, "end")?)?,
        }),
        "buckets" => Ok(Command::SelectBuckets {
            user_id: filters.require_id("user_id")?,
            from: parse_timestamp(filters.require(BinaryOperator::GtEq, "start")?)?,
            to: parse_timestamp(filters.require(BinaryOperator::LtEq, "end")?)?,
            granularity_ms: parse_iso_duration(&parse_string(
                filters.require(BinaryOperator::Eq, "granularity")?,
            )?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `column <op> value` predicates from a WHERE clause.
/// Predicates on other columns are ignored.
struct Filters<'a> {
    predicates: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut predicates)?;
        }
        Ok(Self { predicates })
    }

    fn optional(&self, op: BinaryOperator, column: &str) -> Option<&'a Expr> {
        self.predicates
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn require(&self, op: BinaryOperator, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(op, column).ok_or(SqlError::MissingFilter(column))
    }

    fn require_id(&self, column: &'static str) -> Result<Id, SqlError> {
        parse_id(self.require(BinaryOperator::Eq, column)?)
    }

    fn version(&self) -> Result<Option<u64>, SqlError> {
        self.optional(BinaryOperator::Eq, "version")
            .map(parse_version)
            .transpose()
    }

    fn page_request(&self) -> Result<PageRequest, SqlError> {
        let mut req = PageRequest::default();
        if let Some(expr) = self.optional(BinaryOperator::Eq, "sort") {
            req.sort = parse_string(expr)?.parse().map_err(SqlError::Parse)?;
        }
        if let Some(expr) = self.optional(BinaryOperator::Eq, "direction") {
            req.direction = parse_string(expr)?.parse().map_err(SqlError::Parse)?;
        }
        if let Some(expr) = self.optional(BinaryOperator::Eq, "page") {
            req.page = parse_usize(expr)?;
        }
        if let Some(expr) = self.optional(BinaryOperator::Eq, "size") {
            req.size = parse_usize(expr)?;
        }
        Ok(req)
    }
}

fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(column) = expr_column_name(left) {
                out.push((column, op.clone(), right.as_ref()));
            }
            Ok(())
        }
        Expr::Identifier(_) | Expr::Value(_) => Ok(()),
        other => Err(SqlError::Unsupported(format!("WHERE clause: {other}"))),
    }
}

// ── ISO-8601 durations ────────────────────────────────────────

/// Parse `[±]PnDTnHnMn[.n]S` (case-insensitive, components optional, each
/// signed) into milliseconds. Sub-millisecond fractions are truncated.
pub fn parse_iso_duration(text: &str) -> Result<Ms, SqlError> {
    let invalid = || SqlError::Parse(format!("invalid ISO-8601 duration: {text:?}"));
    let upper = text.trim().to_ascii_uppercase();

    let (negate, unsigned) = match upper.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, upper.strip_prefix('+').unwrap_or(&upper)),
    };
    let body = unsigned.strip_prefix('P').ok_or_else(invalid)?;
    let (date, time) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut total_ms: i128 = 0;
    let mut seen_component = false;

    if !date.is_empty() {
        let days = date.strip_suffix('D').ok_or_else(invalid)?;
        total_ms += parse_signed_int(days).ok_or_else(invalid)? * 86_400_000;
        seen_component = true;
    }

    if let Some(mut rest) = time {
        if rest.is_empty() {
            return Err(invalid());
        }
        for (unit, unit_ms) in [('H', 3_600_000i128), ('M', 60_000)] {
            if let Some(pos) = rest.find(unit) {
                total_ms += parse_signed_int(&rest[..pos]).ok_or_else(invalid)? * unit_ms;
                rest = &rest[pos + 1..];
                seen_component = true;
            }
        }
        if !rest.is_empty() {
            let seconds = rest.strip_suffix('S').ok_or_else(invalid)?;
            total_ms += parse_seconds_ms(seconds).ok_or_else(invalid)?;
            seen_component = true;
        }
    }

    if !seen_component {
        return Err(invalid());
    }
    if negate {
        total_ms = -total_ms;
    }
    Ms::try_from(total_ms).map_err(|_| SqlError::Parse(format!("duration out of range: {text:?}")))
}

fn parse_signed_int(s: &str) -> Option<i128> {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.len() > 18 {
        return None;
    }
    s.parse().ok()
}

/// `[±]seconds[.fraction]` → milliseconds, fraction limited to 9 digits.
fn parse_seconds_ms(s: &str) -> Option<i128> {
    let negative = s.starts_with('-');
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (whole, fraction) = match unsigned.split_once(['.', ',']) {
        Some((w, f)) => (w, f),
        None => (unsigned, ""),
    };
    let whole = parse_signed_int(whole)?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let millis: i128 = format!("{fraction:0<3}")[..3].parse().ok()?;
    let ms = whole * 1_000 + millis;
    Some(if negative { -ms } else { ms })
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_id(expr: &Expr) -> Result<Id, SqlError> {
    let v = parse_i64(expr)?;
    Id::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_version(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid version")))
}

fn parse_version_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_version(expr).map(Some)
}

/// Unix milliseconds, either as an integer or an RFC 3339 string.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let s = s.trim();
        if let Ok(ms) = s.parse::<Ms>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_status(expr: &Expr) -> Result<SlotStatus, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

/// `ARRAY[5, 6]`, or text such as `'5,6'` / `'{5,6}'` (how bound parameters arrive).
fn parse_id_list(expr: &Expr) -> Result<Vec<Id>, SqlError> {
    match expr {
        Expr::Array(ast::Array { elem, .. }) => elem.iter().map(parse_id).collect(),
        _ => {
            let text = parse_string(expr)?;
            let inner = text
                .trim()
                .trim_start_matches(['{', '['])
                .trim_end_matches(['}', ']']);
            inner
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Id>()
                        .map_err(|e| SqlError::Parse(format!("bad id {s:?} in list: {e}")))
                })
                .collect()
        }
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
