use chrono::{NaiveDate, NaiveDateTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{GrantOverrides, ReservationRequest, session_minutes_from_hours};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertFacility {
        id: Ulid,
        name: Option<String>,
        allows_reservations: bool,
        session_minutes: u32,
        capacity: u32,
    },
    SetFacilityHours {
        facility_id: Ulid,
        hours: DayHours,
    },
    DefinePlan {
        plan: Plan,
    },
    RegisterMember {
        id: Ulid,
        name: Option<String>,
    },
    SetAllowance {
        member_id: Ulid,
        allowed: u32,
        used: u32,
    },
    InsertReservation {
        member_id: Ulid,
        facility_id: Ulid,
        request: ReservationRequest,
    },
    CancelReservation {
        id: Ulid,
        member_id: Ulid,
    },
    InsertGrant {
        id: Ulid,
        member_id: Ulid,
        /// `None` renews the plan of the member's latest grant.
        plan_id: Option<Ulid>,
        overrides: GrantOverrides,
    },
    InvalidateGrant {
        id: Ulid,
        member_id: Ulid,
    },
    ExtendGrant {
        grant_id: Ulid,
        extra_days: u32,
    },
    SelectAvailability {
        facility_id: Ulid,
        weekday: Weekday,
        date: NaiveDate,
    },
    SelectReservations {
        member_id: Ulid,
    },
    SelectActiveGrants {
        member_id: Ulid,
    },
    SelectGrants {
        member_id: Ulid,
    },
    SelectMember {
        id: Ulid,
    },
}

/// Positional column order used when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "facilities" => &["id", "name", "allows_reservations", "session_hours", "capacity"],
        "facility_hours" => &["facility_id", "weekday", "opens", "open_time", "close_time"],
        "plans" => &["id", "name", "price", "duration_units", "kind", "allowed_reservations"],
        "members" => &["id", "name"],
        "allowances" => &["member_id", "allowed_reservations", "used_reservations"],
        "reservations" => &["id", "member_id", "facility_id", "date", "start_time", "end_time", "weekday", "notes"],
        "grants" => &[
            "id",
            "member_id",
            "plan_id",
            "start_date",
            "end_date",
            "give_full_day",
            "will_pay_later",
            "paid_amount",
            "for_free",
        ],
        "grant_extensions" => &["grant_id", "extra_days"],
        _ => &[],
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported("more than one statement".into()));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Every statement of a simple-query string, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row layout a statement produces, decided from its target table alone so
/// it also works on prepared statements whose values are still `$n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Availability,
    Reservation,
    Grant,
    Member,
}

pub fn row_shape(sql: &str) -> Option<RowShape> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => match insert_table_name(insert).ok()?.as_str() {
            "reservations" => Some(RowShape::Reservation),
            "grants" | "grant_extensions" => Some(RowShape::Grant),
            _ => None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "availability" => Some(RowShape::Availability),
                "reservations" => Some(RowShape::Reservation),
                "grants" | "active_grants" => Some(RowShape::Grant),
                "members" => Some(RowShape::Member),
                _ => None,
            }
        }
        _ => None,
    }
}

// ── Column/value pairs ────────────────────────────────────────

/// Column → expression pairs from an INSERT row or a WHERE clause.
struct Fields<'a> {
    table: &'static str,
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Fields<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.pairs
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, e)| *e)
    }

    /// A column that must be present and non-NULL.
    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(col) {
            Some(e) if !is_null(e) => Ok(e),
            _ => Err(SqlError::MissingColumn(self.table, col)),
        }
    }

    /// A column that may be absent or NULL.
    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.get(col).filter(|e| !is_null(e))
    }
}

fn known_table(name: &str) -> Result<&'static str, SqlError> {
    const TABLES: &[&str] = &[
        "facilities",
        "facility_hours",
        "plans",
        "members",
        "allowances",
        "reservations",
        "grants",
        "grant_extensions",
        "availability",
        "active_grants",
    ];
    TABLES
        .iter()
        .find(|t| **t == name)
        .copied()
        .ok_or_else(|| SqlError::UnknownTable(name.to_string()))
}

fn insert_fields<'a>(table: &'static str, insert: &'a ast::Insert) -> Result<Fields<'a>, SqlError> {
    let row = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    Ok(Fields {
        table,
        pairs: columns.into_iter().zip(row.iter()).collect(),
    })
}

fn where_fields<'a>(table: &'static str, selection: &'a Option<Expr>) -> Result<Fields<'a>, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut pairs)?;
    }
    Ok(Fields { table, pairs })
}

/// Flatten `a = x AND b = y AND ...`. Anything else is rejected.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = known_table(&insert_table_name(insert)?)?;
    let f = insert_fields(table, insert)?;

    match table {
        "facilities" => {
            let hours = parse_f64(f.required("session_hours")?)?;
            let session_minutes = session_minutes_from_hours(hours).ok_or_else(|| {
                SqlError::Parse(format!("session_hours {hours} is not a positive whole number of minutes"))
            })?;
            Ok(Command::UpsertFacility {
                id: parse_ulid(f.required("id")?)?,
                name: f.optional("name").map(parse_string).transpose()?,
                allows_reservations: f.optional("allows_reservations").map(parse_bool).transpose()?.unwrap_or(true),
                session_minutes,
                capacity: parse_u32(f.required("capacity")?)?,
            })
        }
        "facility_hours" => {
            let weekday = parse_weekday(f.required("weekday")?)?;
            let opens = f.optional("opens").map(parse_bool).transpose()?.unwrap_or(true);
            let hours = if opens {
                DayHours::open(
                    weekday,
                    parse_slot_time(f.required("open_time")?)?,
                    parse_slot_time(f.required("close_time")?)?,
                )
            } else {
                DayHours::closed(weekday)
            };
            Ok(Command::SetFacilityHours {
                facility_id: parse_ulid(f.required("facility_id")?)?,
                hours,
            })
        }
        "plans" => {
            let kind_text = parse_string(f.required("kind")?)?;
            let kind = kind_text.parse::<PlanKind>().map_err(SqlError::Parse)?;
            Ok(Command::DefinePlan {
                plan: Plan {
                    id: parse_ulid(f.required("id")?)?,
                    name: f.optional("name").map(parse_string).transpose()?,
                    price: parse_u64(f.required("price")?)?,
                    duration_units: parse_u32(f.required("duration_units")?)?,
                    kind,
                    allowed_reservations: f.optional("allowed_reservations").map(parse_u32).transpose()?,
                },
            })
        }
        "members" => Ok(Command::RegisterMember {
            id: parse_ulid(f.required("id")?)?,
            name: f.optional("name").map(parse_string).transpose()?,
        }),
        "allowances" => Ok(Command::SetAllowance {
            member_id: parse_ulid(f.required("member_id")?)?,
            allowed: parse_u32(f.required("allowed_reservations")?)?,
            used: f.optional("used_reservations").map(parse_u32).transpose()?.unwrap_or(0),
        }),
        "reservations" => {
            let start = parse_slot_time(f.required("start_time")?)?;
            let end = parse_slot_time(f.required("end_time")?)?;
            if start >= end {
                return Err(SqlError::Parse("start_time must be before end_time".into()));
            }
            let date = parse_date(f.required("date")?)?;
            let weekday = match f.optional("weekday") {
                Some(e) => parse_weekday(e)?,
                None => chrono::Datelike::weekday(&date),
            };
            Ok(Command::InsertReservation {
                member_id: parse_ulid(f.required("member_id")?)?,
                facility_id: parse_ulid(f.required("facility_id")?)?,
                request: ReservationRequest {
                    id: f.optional("id").map(parse_ulid).transpose()?.unwrap_or_else(Ulid::new),
                    date,
                    slot: Slot::new(start, end),
                    weekday,
                    notes: f.optional("notes").map(parse_string).transpose()?,
                },
            })
        }
        "grants" => Ok(Command::InsertGrant {
            id: f.optional("id").map(parse_ulid).transpose()?.unwrap_or_else(Ulid::new),
            member_id: parse_ulid(f.required("member_id")?)?,
            plan_id: f.optional("plan_id").map(parse_ulid).transpose()?,
            overrides: GrantOverrides {
                start_date: f.optional("start_date").map(parse_datetime).transpose()?,
                end_date: f.optional("end_date").map(parse_datetime).transpose()?,
                give_full_day: f.optional("give_full_day").map(parse_bool).transpose()?.unwrap_or(false),
                will_pay_later: f.optional("will_pay_later").map(parse_bool).transpose()?.unwrap_or(false),
                paid_amount: f.optional("paid_amount").map(parse_u64).transpose()?,
                for_free: f.optional("for_free").map(parse_bool).transpose()?.unwrap_or(false),
            },
        }),
        "grant_extensions" => Ok(Command::ExtendGrant {
            grant_id: parse_ulid(f.required("grant_id")?)?,
            extra_days: parse_u32(f.required("extra_days")?)?,
        }),
        other => Err(SqlError::Unsupported(format!("INSERT into {other}"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = known_table(&delete_table_name(delete)?)?;
    let f = where_fields(table, &delete.selection)?;

    match table {
        "reservations" => Ok(Command::CancelReservation {
            id: parse_ulid(f.required("id")?)?,
            member_id: parse_ulid(f.required("member_id")?)?,
        }),
        "grants" => Ok(Command::InvalidateGrant {
            id: parse_ulid(f.required("id")?)?,
            member_id: parse_ulid(f.required("member_id")?)?,
        }),
        other => Err(SqlError::Unsupported(format!("DELETE from {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = known_table(&table_factor_name(&from.relation)?)?;
    let f = where_fields(table, &select.selection)?;

    match table {
        "availability" => {
            let date = parse_date(f.required("date")?)?;
            let weekday = match f.optional("weekday") {
                Some(e) => parse_weekday(e)?,
                None => chrono::Datelike::weekday(&date),
            };
            Ok(Command::SelectAvailability {
                facility_id: parse_ulid(f.required("facility_id")?)?,
                weekday,
                date,
            })
        }
        "reservations" => Ok(Command::SelectReservations {
            member_id: parse_ulid(f.required("member_id")?)?,
        }),
        "active_grants" => Ok(Command::SelectActiveGrants {
            member_id: parse_ulid(f.required("member_id")?)?,
        }),
        "grants" => Ok(Command::SelectGrants {
            member_id: parse_ulid(f.required("member_id")?)?,
        }),
        "members" => Ok(Command::SelectMember {
            id: parse_ulid(f.required("id")?)?,
        }),
        other => Err(SqlError::Unsupported(format!("SELECT from {other}"))),
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

/// Text of a quoted string or a bare number.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected literal, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected non-negative integer, got {s}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_u64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected number, got {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

fn parse_slot_time(expr: &Expr) -> Result<SlotTime, SqlError> {
    let s = literal_text(expr)?;
    s.parse().map_err(|e: ParseSlotTimeError| SqlError::Parse(e.to_string()))
}

fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("bad weekday: {s}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Accepts `YYYY-MM-DD HH:MM[:SS[.fff]]`, the same with a `T` separator,
/// or a bare date meaning midnight.
fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = literal_text(expr)?.trim();
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    if let Some(dt) = FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
    {
        return Ok(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
        .map_err(|_| SqlError::Parse(format!("bad timestamp: {s}")))
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
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
}
