use std::collections::{BTreeSet, HashMap};

use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{
    ChangeInput, Decision, EngineError, NewChangeRequest, NewRoom, NewSession, RequestFilter, Review,
    RoomFilter, SessionFilter, allocation_changes_from_json,
};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom(NewRoom),
    SelectRooms(RoomFilter),
    InsertAvailability {
        tutor_id: String,
        start: Ms,
        end: Ms,
    },
    InsertSessions(Vec<NewSession>),
    InsertSessionStatus {
        session_id: Ulid,
        status: SessionStatus,
    },
    SelectSessions(SessionFilter),
    InsertChangeRequest(ChangeRequestInsert),
    SelectChangeRequests(RequestFilter),
    InsertReview(Review),
    InsertClarificationResponse {
        request_id: Ulid,
        response: String,
    },
    SelectConflicts {
        tutor_id: String,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    SelectSlots {
        tutor_id: String,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectOptimizationPlan {
        focus: BTreeSet<FocusArea>,
        constraints: PlanConstraints,
    },
}

/// A `change_requests` row before its payload is checked against the change type.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequestInsert {
    pub id: Option<Ulid>,
    pub kind: RequestKind,
    pub target_id: Option<Ulid>,
    pub change_type: Option<String>,
    pub change_data: Option<serde_json::Value>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Priority,
    pub deadline: Option<Ms>,
}

impl ChangeRequestInsert {
    /// Decode `change_data` for the row's kind. Payload problems are validation errors.
    pub fn into_request(self) -> Result<NewChangeRequest, EngineError> {
        let data = self
            .change_data
            .ok_or_else(|| EngineError::validation("change_data is required"))?;
        let (change, allocation) = match self.kind {
            RequestKind::SessionChange => {
                let change_type = self
                    .change_type
                    .ok_or_else(|| EngineError::validation("change_type is required for a session change"))?;
                (Some(ChangeInput::from_json(&change_type, &data)?), Vec::new())
            }
            RequestKind::ResourceAllocation => (None, allocation_changes_from_json(&data)?),
        };
        Ok(NewChangeRequest {
            id: self.id,
            kind: self.kind,
            target_id: self.target_id,
            change,
            allocation,
            title: self.title,
            description: self.description,
            priority: self.priority,
            deadline: self.deadline,
        })
    }
}

// Column order assumed when an INSERT names no columns.
const ROOM_COLUMNS: &[&str] = &["name", "building", "floor", "capacity", "equipment"];
const AVAILABILITY_COLUMNS: &[&str] = &["tutor_id", "start", "end"];
const SESSION_COLUMNS: &[&str] = &[
    "id",
    "tutor_id",
    "student_ids",
    "subject",
    "start",
    "end",
    "mode",
    "location",
    "meeting_link",
    "equipment",
    "class_id",
    "notes",
];
const SESSION_STATUS_COLUMNS: &[&str] = &["session_id", "status"];
const CHANGE_REQUEST_COLUMNS: &[&str] = &[
    "id",
    "kind",
    "target_id",
    "change_type",
    "change_data",
    "title",
    "description",
    "priority",
    "deadline",
];
const REVIEW_COLUMNS: &[&str] = &["request_id", "decision", "notes", "location"];
const CLARIFICATION_COLUMNS: &[&str] = &["request_id", "response"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns): (&'static str, &[&str]) = match table.as_str() {
        "rooms" => ("rooms", ROOM_COLUMNS),
        "availability" => ("availability", AVAILABILITY_COLUMNS),
        "sessions" => ("sessions", SESSION_COLUMNS),
        "session_status" => ("session_status", SESSION_STATUS_COLUMNS),
        "change_requests" => ("change_requests", CHANGE_REQUEST_COLUMNS),
        "reviews" => ("reviews", REVIEW_COLUMNS),
        "clarification_responses" => ("clarification_responses", CLARIFICATION_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let mut rows = insert_rows(insert, table, columns)?;

    if table == "sessions" {
        return rows
            .iter()
            .enumerate()
            .map(|(i, row)| new_session(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}"))))
            .collect::<Result<_, _>>()
            .map(Command::InsertSessions);
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = rows.remove(0);

    match table {
        "rooms" => Ok(Command::InsertRoom(NewRoom {
            name: row.required("name")?,
            building: row.text("building").unwrap_or_default(),
            floor: row.i32("floor")?.unwrap_or(0),
            capacity: row.u32("capacity")?.ok_or(SqlError::MissingColumn("capacity"))?,
            equipment: row.equipment("equipment")?,
        })),
        "availability" => Ok(Command::InsertAvailability {
            tutor_id: row.required("tutor_id")?,
            start: row.required_instant("start")?,
            end: row.required_instant("end")?,
        }),
        "session_status" => {
            let text = row.required("status")?;
            Ok(Command::InsertSessionStatus {
                session_id: row.required_ulid("session_id")?,
                status: SessionStatus::parse(&text).ok_or(SqlError::BadValue("status", text))?,
            })
        }
        "change_requests" => {
            let kind = match row.text("kind") {
                Some(text) => RequestKind::parse(&text).ok_or(SqlError::BadValue("kind", text))?,
                None => RequestKind::SessionChange,
            };
            let priority = match row.text("priority") {
                Some(text) => Priority::parse(&text).ok_or(SqlError::BadValue("priority", text))?,
                None => Priority::default(),
            };
            let change_data = row
                .text("change_data")
                .map(|text| serde_json::from_str(&text).map_err(|e| SqlError::BadValue("change_data", e.to_string())))
                .transpose()?;
            Ok(Command::InsertChangeRequest(ChangeRequestInsert {
                id: row.ulid("id")?,
                kind,
                target_id: row.ulid("target_id")?,
                change_type: row.text("change_type"),
                change_data,
                title: row.text("title"),
                description: row.text("description"),
                priority,
                deadline: row.instant("deadline")?,
            }))
        }
        "reviews" => {
            let text = row.required("decision")?;
            Ok(Command::InsertReview(Review {
                request_id: row.required_ulid("request_id")?,
                decision: Decision::parse(&text).ok_or(SqlError::BadValue("decision", text))?,
                notes: row.text("notes"),
                location: row.text("location"),
            }))
        }
        "clarification_responses" => Ok(Command::InsertClarificationResponse {
            request_id: row.required_ulid("request_id")?,
            response: row.text("response").unwrap_or_default(),
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn new_session(row: &Row) -> Result<NewSession, SqlError> {
    let mode = match row.text("mode") {
        Some(text) => Mode::parse(&text).ok_or(SqlError::BadValue("mode", text))?,
        None if row.text("location").is_some() => Mode::Offline,
        None => Mode::Online,
    };
    let student_ids = row
        .text("student_ids")
        .map(|text| {
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(NewSession {
        id: row.ulid("id")?,
        tutor_id: row.required("tutor_id")?,
        student_ids,
        subject: row.required("subject")?,
        start: row.required_instant("start")?,
        end: row.required_instant("end")?,
        mode,
        location: row.text("location"),
        meeting_link: row.text("meeting_link"),
        equipment: row.equipment("equipment")?,
        class_id: row.text("class_id"),
        notes: row.text("notes"),
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rooms" => {
            filters.allow("rooms", &["building", "capacity", "equipment"])?;
            Ok(Command::SelectRooms(RoomFilter {
                building: filters.text("building"),
                min_capacity: filters.u32_at(Op::Ge, "capacity")?.or(filters.u32_at(Op::Eq, "capacity")?),
                equipment: match filters.text("equipment") {
                    Some(text) => parse_equipment_list(&text).map_err(|e| SqlError::BadValue("equipment", e))?,
                    None => BTreeSet::new(),
                },
            }))
        }
        "sessions" => {
            filters.allow("sessions", &["id", "tutor_id", "status"])?;
            let status = match filters.text("status") {
                Some(text) => Some(SessionStatus::parse(&text).ok_or(SqlError::BadValue("status", text))?),
                None => None,
            };
            Ok(Command::SelectSessions(SessionFilter {
                id: filters.ulid("id")?,
                tutor_id: filters.text("tutor_id"),
                status,
            }))
        }
        "change_requests" => {
            filters.allow("change_requests", &["id", "kind", "status"])?;
            let kind = match filters.text("kind") {
                Some(text) => Some(RequestKind::parse(&text).ok_or(SqlError::BadValue("kind", text))?),
                None => None,
            };
            let status = match filters.text("status") {
                Some(text) => Some(RequestStatus::parse(&text).ok_or(SqlError::BadValue("status", text))?),
                None => None,
            };
            Ok(Command::SelectChangeRequests(RequestFilter {
                id: filters.ulid("id")?,
                kind,
                status,
            }))
        }
        "conflicts" => {
            filters.allow("conflicts", &["tutor_id", "start", "end", "exclude"])?;
            Ok(Command::SelectConflicts {
                tutor_id: filters.text("tutor_id").ok_or(SqlError::MissingFilter("tutor_id"))?,
                start: filters.instant_at(Op::Eq, "start")?.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.instant_at(Op::Eq, "end")?.ok_or(SqlError::MissingFilter("end"))?,
                exclude: filters.ulid("exclude")?,
            })
        }
        "slots" => {
            filters.allow("slots", &["tutor_id", "start", "end", "min_duration"])?;
            Ok(Command::SelectSlots {
                tutor_id: filters.text("tutor_id").ok_or(SqlError::MissingFilter("tutor_id"))?,
                start: filters.instant_at(Op::Ge, "start")?.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.instant_at(Op::Le, "end")?.ok_or(SqlError::MissingFilter("end"))?,
                min_duration: filters.i64_at(Op::Eq, "min_duration")?,
            })
        }
        "optimization_plan" => {
            filters.allow(
                "optimization_plan",
                &["start", "end", "focus", "max_sessions", "max_group_size", "min_room_utilization"],
            )?;
            let start = filters.instant_at(Op::Ge, "start")?.ok_or(SqlError::MissingFilter("start"))?;
            let end = filters.instant_at(Op::Le, "end")?.ok_or(SqlError::MissingFilter("end"))?;
            let window = Span::try_new(start, end)
                .ok_or_else(|| SqlError::BadValue("end", "plan window end must be after start".into()))?;
            let mut focus = BTreeSet::new();
            if let Some(text) = filters.text("focus") {
                for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    focus.insert(FocusArea::parse(part).ok_or_else(|| SqlError::BadValue("focus", part.to_string()))?);
                }
            }
            Ok(Command::SelectOptimizationPlan {
                focus,
                constraints: PlanConstraints {
                    window,
                    max_sessions_per_tutor: filters.u32_at(Op::Eq, "max_sessions")?,
                    max_group_size: filters.u32_at(Op::Eq, "max_group_size")?,
                    min_room_utilization_pct: filters.u32_at(Op::Eq, "min_room_utilization")?.unwrap_or(0),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows and filters ──────────────────────────────────────────

/// One VALUES row keyed by column name. `None` is SQL NULL.
struct Row {
    values: HashMap<String, Option<String>>,
}

impl Row {
    /// Present, non-null and not blank.
    fn text(&self, col: &str) -> Option<String> {
        self.values
            .get(col)
            .cloned()
            .flatten()
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, col: &'static str) -> Result<String, SqlError> {
        self.text(col).ok_or(SqlError::MissingColumn(col))
    }

    fn ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.text(col).map(|t| parse_ulid(col, &t)).transpose()
    }

    fn required_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn instant(&self, col: &'static str) -> Result<Option<Ms>, SqlError> {
        self.text(col).map(|t| parse_instant_value(col, &t)).transpose()
    }

    fn required_instant(&self, col: &'static str) -> Result<Ms, SqlError> {
        self.instant(col)?.ok_or(SqlError::MissingColumn(col))
    }

    fn u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.text(col).map(|t| parse_number(col, &t)).transpose()
    }

    fn i32(&self, col: &'static str) -> Result<Option<i32>, SqlError> {
        self.text(col).map(|t| parse_number(col, &t)).transpose()
    }

    fn equipment(&self, col: &'static str) -> Result<BTreeSet<Equipment>, SqlError> {
        match self.text(col) {
            Some(text) => parse_equipment_list(&text).map_err(|e| SqlError::BadValue(col, e)),
            None => Ok(BTreeSet::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Eq,
    Ge,
    Le,
}

#[derive(Default)]
struct Filters {
    terms: HashMap<(String, Op), Option<String>>,
}

impl Filters {
    fn allow(&self, table: &'static str, columns: &[&str]) -> Result<(), SqlError> {
        match self.terms.keys().find(|(col, _)| !columns.contains(&col.as_str())) {
            Some((col, _)) => Err(SqlError::UnknownColumn(table, col.clone())),
            None => Ok(()),
        }
    }

    fn at(&self, op: Op, col: &str) -> Option<String> {
        self.terms
            .get(&(col.to_string(), op))
            .cloned()
            .flatten()
            .filter(|v| !v.trim().is_empty())
    }

    fn text(&self, col: &str) -> Option<String> {
        self.at(Op::Eq, col)
    }

    fn ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.text(col).map(|t| parse_ulid(col, &t)).transpose()
    }

    fn instant_at(&self, op: Op, col: &'static str) -> Result<Option<Ms>, SqlError> {
        self.at(op, col).map(|t| parse_instant_value(col, &t)).transpose()
    }

    fn i64_at(&self, op: Op, col: &'static str) -> Result<Option<i64>, SqlError> {
        self.at(op, col).map(|t| parse_number(col, &t)).transpose()
    }

    fn u32_at(&self, op: Op, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.at(op, col).map(|t| parse_number(col, &t)).transpose()
    }
}

/// Flatten an AND-chain of `column op literal` terms.
fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, filters)?;
                    return collect_filters(right, filters);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::Ge,
                ast::BinaryOperator::LtEq => Op::Le,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.terms.insert((col, op), literal(right)?);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn insert_rows(insert: &ast::Insert, table: &'static str, defaults: &[&str]) -> Result<Vec<Row>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(col) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, col.clone()));
    }

    values
        .rows
        .iter()
        .map(|exprs| {
            if exprs.len() > columns.len() || (!insert.columns.is_empty() && exprs.len() != columns.len()) {
                return Err(SqlError::WrongArity(table, columns.len(), exprs.len()));
            }
            let mut values = HashMap::new();
            for (col, expr) in columns.iter().zip(exprs) {
                values.insert(col.clone(), literal(expr)?);
            }
            Ok(Row { values })
        })
        .collect()
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Text of a literal; `None` for NULL. Casts are looked through.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::Number(s, _)
            | Value::SingleQuotedString(s)
            | Value::DoubleQuotedString(s)
            | Value::EscapedStringLiteral(s) => Ok(Some(s.clone())),
            Value::DollarQuotedString(d) => Ok(Some(d.value.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(expr),
        other => Err(SqlError::Parse(format!("expected value, got {other}"))),
    }
}

fn parse_ulid(col: &'static str, text: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(text.trim()).map_err(|e| SqlError::BadValue(col, format!("bad ULID {text:?}: {e}")))
}

fn parse_instant_value(col: &'static str, text: &str) -> Result<Ms, SqlError> {
    parse_instant(text).ok_or_else(|| SqlError::BadValue(col, format!("{text:?} is not a timestamp")))
}

fn parse_number<T: std::str::FromStr>(col: &'static str, text: &str) -> Result<T, SqlError>
where
    T::Err: std::fmt::Display,
{
    text.trim()
        .parse()
        .map_err(|e| SqlError::BadValue(col, format!("{text:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad {0}: {1}")]
    BadValue(&'static str, String),
}
