use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetConfig {
        config: BusinessConfig,
    },
    SelectConfig,
    InsertCourt {
        id: Ulid,
        name: Option<String>,
    },
    DeleteCourt {
        id: Ulid,
    },
    SelectCourts,
    InsertReservation {
        reservation: Reservation,
    },
    BatchInsertReservations {
        reservations: Vec<Reservation>,
    },
    CancelReservation {
        id: Ulid,
    },
    ConfirmReservation {
        id: Ulid,
    },
    SelectReservations {
        court_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectSlots {
        court_id: Ulid,
        date: NaiveDate,
        as_of: Option<NaiveDateTime>,
    },
    SelectRecurrencePreview {
        rule: RecurrenceRule,
    },
    InsertRecurrence {
        rule: RecurrenceRule,
        payment_method_id: Option<String>,
        /// Priced per occurrence from the venue rates when absent.
        total_amount: Option<Money>,
    },
    SelectPeakHours {
        court_id: Ulid,
        date: NaiveDate,
    },
    Listen {
        channel: String,
    },
}

const CONFIG_COLUMNS: &[&str] = &[
    "opening_time",
    "closing_time",
    "standard_rate",
    "peak_rate",
    "peak_rate_percentage",
    "min_lead_minutes",
    "peak_hours",
];
const COURT_COLUMNS: &[&str] = &["id", "name"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "court_id",
    "booking_date",
    "start_time",
    "end_time",
    "sport_id",
    "payment_method_id",
    "total_amount",
    "status",
];
const CONFIRMATION_COLUMNS: &[&str] = &["reservation_id"];
const RECURRENCE_COLUMNS: &[&str] = &[
    "court_id",
    "base_date",
    "duration_days",
    "weekdays",
    "start_time",
    "end_time",
    "sport_id",
    "payment_method_id",
    "total_amount",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.get(..7).is_some_and(|kw| kw.eq_ignore_ascii_case("LISTEN ")) {
        let channel = trimmed[7..].trim().trim_end_matches(';').trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns = match table.as_str() {
        "config" => CONFIG_COLUMNS,
        "courts" => COURT_COLUMNS,
        "reservations" => RESERVATION_COLUMNS,
        "confirmations" => CONFIRMATION_COLUMNS,
        "recurring_reservations" => RECURRENCE_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let mut rows = insert_rows(insert, columns)?;

    match table.as_str() {
        "config" => Ok(Command::SetConfig { config: config_from(&rows[0])? }),
        "courts" => {
            let row = &rows[0];
            Ok(Command::InsertCourt {
                id: row.required("id")?,
                name: row.text("name")?,
            })
        }
        "reservations" if rows.len() == 1 => Ok(Command::InsertReservation {
            reservation: reservation_from(&rows[0])?,
        }),
        "reservations" => {
            let reservations = rows
                .iter()
                .enumerate()
                .map(|(i, row)| reservation_from(row).map_err(|e| e.in_row(i)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::BatchInsertReservations { reservations })
        }
        "confirmations" => Ok(Command::ConfirmReservation {
            id: rows[0].required("reservation_id")?,
        }),
        _ => {
            let row = rows.swap_remove(0);
            Ok(Command::InsertRecurrence {
                rule: rule_from(&row)?,
                payment_method_id: row.text("payment_method_id")?,
                total_amount: row.optional("total_amount")?,
            })
        }
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Fields::filters(delete.selection.as_ref())?;
    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt { id: filters.required("id")? }),
        "reservations" => Ok(Command::CancelReservation { id: filters.required("id")? }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let table = table_factor_name(&from.relation)?;
    let filters = Fields::filters(select.selection.as_ref())?;

    match table.as_str() {
        "config" => Ok(Command::SelectConfig),
        "courts" => Ok(Command::SelectCourts),
        "reservations" => Ok(Command::SelectReservations {
            court_id: filters.required("court_id")?,
            date: filters.optional("booking_date")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            court_id: filters.required("court_id")?,
            date: filters.required("booking_date")?,
            as_of: filters.text("as_of")?.map(|s| parse_timestamp("as_of", &s)).transpose()?,
        }),
        "recurrence_preview" => Ok(Command::SelectRecurrencePreview { rule: rule_from(&filters)? }),
        "peak_hours" => Ok(Command::SelectPeakHours {
            court_id: filters.required("court_id")?,
            date: filters.required("booking_date")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row → domain ──────────────────────────────────────────────

fn config_from(row: &Fields) -> Result<BusinessConfig, SqlError> {
    let mut config = BusinessConfig::new(
        row.required("opening_time")?,
        row.required("closing_time")?,
        row.required("standard_rate")?,
    );
    config.peak_rate = row.optional("peak_rate")?;
    config.peak_rate_percentage = row.optional("peak_rate_percentage")?.unwrap_or(0);
    config.min_lead_minutes = row.optional("min_lead_minutes")?.unwrap_or(0);
    if let Some(list) = row.text("peak_hours")? {
        config.peak_hour_windows = parse_list("peak_hours", &list)?;
    }
    Ok(config)
}

fn reservation_from(row: &Fields) -> Result<Reservation, SqlError> {
    Ok(Reservation {
        id: row.required("id")?,
        court_id: row.required("court_id")?,
        date: row.required("booking_date")?,
        start_time: row.required("start_time")?,
        end_time: row.required("end_time")?,
        status: row.optional("status")?.unwrap_or(ReservationStatus::Pending),
        sport_id: row.text("sport_id")?.unwrap_or_default(),
        payment_method_id: row.text("payment_method_id")?,
        total_amount: row.required("total_amount")?,
        payment_deadline: None,
    })
}

/// Every field is optional here so that the engine can name what is missing.
fn rule_from(fields: &Fields) -> Result<RecurrenceRule, SqlError> {
    let mut rule = RecurrenceRule {
        base_date: fields.optional("base_date")?,
        duration_days: fields.optional("duration_days")?.unwrap_or(0),
        weekdays: match fields.text("weekdays")? {
            Some(list) => parse_list("weekdays", &list)?,
            None => BTreeSet::new(),
        },
        start_time: fields.optional("start_time")?,
        end_time: fields.optional("end_time")?,
        court_id: fields.optional("court_id")?,
        sport_id: fields.text("sport_id")?.unwrap_or_default(),
        frequency: fields.optional("frequency")?.unwrap_or_default(),
    };
    if let Some(months) = fields.optional::<u32>("duration_months")? {
        rule = rule.for_months(months);
    }
    Ok(rule)
}

fn parse_list<T>(column: &'static str, list: &str) -> Result<BTreeSet<T>, SqlError>
where
    T: FromStr + Ord,
    T::Err: Display,
{
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| SqlError::bad_value(column, e)))
        .collect()
}

fn parse_timestamp(column: &'static str, s: &str) -> Result<NaiveDateTime, SqlError> {
    s.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .map_err(|e| SqlError::bad_value(column, e))
}

// ── Column/value access ───────────────────────────────────────

/// Named values from an INSERT row or from `col = value` WHERE filters.
struct Fields {
    cells: Vec<(String, Expr)>,
    missing: fn(&'static str) -> SqlError,
}

impl Fields {
    fn filters(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut cells = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut cells)?;
        }
        Ok(Self {
            cells,
            missing: SqlError::MissingFilter,
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    /// Value as text. Absent columns and NULL are both `None`.
    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), |e| value_text(column, e))
    }

    fn optional<T>(&self, column: &'static str) -> Result<Option<T>, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.text(column)?
            .map(|s| s.parse().map_err(|e| SqlError::bad_value(column, e)))
            .transpose()
    }

    fn required<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(column)?.ok_or((self.missing)(column))
    }
}

fn collect_filters(expr: &Expr, cells: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, cells),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_filters(left, cells)?;
            collect_filters(right, cells)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            cells.push((column, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn insert_rows(insert: &ast::Insert, default_columns: &[&str]) -> Result<Vec<Fields>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
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
    values
        .rows
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(columns.len(), row.len()));
            }
            Ok(Fields {
                cells: columns.iter().cloned().zip(row.iter().cloned()).collect(),
                missing: SqlError::MissingColumn,
            })
        })
        .collect()
}

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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn value_text(column: &'static str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) | Value::Number(s, _) => {
                Ok(Some(s.clone()))
            }
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::bad_value(column, format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => {
            Ok(value_text(column, expr)?.map(|s| format!("-{s}")))
        }
        other => Err(SqlError::bad_value(column, format!("expected a literal, got {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    BadValue { column: &'static str, reason: String },
    InRow(usize, Box<SqlError>),
}

impl SqlError {
    fn bad_value(column: &'static str, reason: impl Display) -> Self {
        SqlError::BadValue {
            column,
            reason: reason.to_string(),
        }
    }

    fn in_row(self, row: usize) -> Self {
        SqlError::InRow(row, Box::new(self))
    }

    /// Malformed values are reported like any other invalid parameter.
    pub fn is_bad_value(&self) -> bool {
        match self {
            SqlError::BadValue { .. } => true,
            SqlError::InRow(_, inner) => inner.is_bad_value(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue { column, reason } => write!(f, "invalid value for {column}: {reason}"),
            SqlError::InRow(row, inner) => write!(f, "row {row}: {inner}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const COURT: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const RES: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn parse_config_with_defaults() {
        let sql = "INSERT INTO config (opening_time, closing_time, standard_rate) VALUES ('08:00', '22:00', 100)";
        match parse_sql(sql).unwrap() {
            Command::SetConfig { config } => {
                assert_eq!(config.opening_time, t("08:00"));
                assert_eq!(config.closing_time, t("22:00"));
                assert_eq!(config.standard_rate, Money(10_000));
                assert_eq!(config.peak_rate, None);
                assert_eq!(config.peak_rate_percentage, 0);
                assert_eq!(config.peak_hour_windows, default_peak_windows());
            }
            other => panic!("expected SetConfig, got {other:?}"),
        }
    }

    #[test]
    fn parse_full_config() {
        let sql = "INSERT INTO config (opening_time, closing_time, standard_rate, peak_rate, peak_rate_percentage, min_lead_minutes, peak_hours) \
                   VALUES ('07:00', '23:00', 80.50, NULL, 25, 30, '19:00, 20:00')";
        match parse_sql(sql).unwrap() {
            Command::SetConfig { config } => {
                assert_eq!(config.standard_rate, Money(8_050));
                assert_eq!(config.peak_rate, None);
                assert_eq!(config.peak_rate_percentage, 25);
                assert_eq!(config.min_lead_minutes, 30);
                let windows: Vec<TimeOfDay> = config.peak_hour_windows.into_iter().collect();
                assert_eq!(windows, vec![t("19:00"), t("20:00")]);
            }
            other => panic!("expected SetConfig, got {other:?}"),
        }
    }

    #[test]
    fn parse_config_bad_time_names_column() {
        let sql = "INSERT INTO config (opening_time, closing_time, standard_rate) VALUES ('8h', '22:00', 100)";
        match parse_sql(sql) {
            Err(e @ SqlError::BadValue { column: "opening_time", .. }) => assert!(e.is_bad_value()),
            other => panic!("expected BadValue, got {other:?}"),
        }
    }

    #[test]
    fn parse_court_insert_and_delete() {
        let cmd = parse_sql(&format!("INSERT INTO courts (id, name) VALUES ('{COURT}', 'Quadra Central')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertCourt {
                id: COURT.parse().unwrap(),
                name: Some("Quadra Central".into())
            }
        );
        let cmd = parse_sql(&format!("INSERT INTO courts (id) VALUES ('{COURT}')")).unwrap();
        assert!(matches!(cmd, Command::InsertCourt { name: None, .. }));
        let cmd = parse_sql(&format!("DELETE FROM courts WHERE id = '{COURT}'")).unwrap();
        assert_eq!(cmd, Command::DeleteCourt { id: COURT.parse().unwrap() });
    }

    #[test]
    fn parse_reservation_insert() {
        let sql = format!(
            "INSERT INTO reservations (id, court_id, booking_date, start_time, end_time, sport_id, payment_method_id, total_amount) \
             VALUES ('{RES}', '{COURT}', '2024-05-10', '18:00', '19:00', 'tennis', 'pix', 150.00)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { reservation: r } => {
                assert_eq!(r.id.to_string(), RES);
                assert_eq!(r.court_id.to_string(), COURT);
                assert_eq!(r.date, date("2024-05-10"));
                assert_eq!(r.start_time, t("18:00"));
                assert_eq!(r.end_time, t("19:00"));
                assert_eq!(r.sport_id, "tennis");
                assert_eq!(r.payment_method_id.as_deref(), Some("pix"));
                assert_eq!(r.total_amount, Money(15_000));
                assert_eq!(r.status, ReservationStatus::Pending);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_reservation_with_status_in_any_column_order() {
        let sql = format!(
            "INSERT INTO reservations (status, total_amount, payment_method_id, sport_id, end_time, start_time, booking_date, court_id, id) \
             VALUES ('confirmed', 90, NULL, 'padel', '11:00', '10:00', '2024-05-10', '{COURT}', '{RES}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { reservation: r } => {
                assert_eq!(r.status, ReservationStatus::Confirmed);
                assert_eq!(r.payment_method_id, None);
                assert_eq!(r.start_time, t("10:00"));
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_batch_reservations() {
        let second = Ulid::new();
        let sql = format!(
            "INSERT INTO reservations (id, court_id, booking_date, start_time, end_time, sport_id, payment_method_id, total_amount) VALUES \
             ('{RES}', '{COURT}', '2024-05-10', '08:00', '09:00', 'tennis', NULL, 100), \
             ('{second}', '{COURT}', '2024-05-10', '12:00', '13:00', 'tennis', NULL, 100)"
        );
        match parse_sql(&sql).unwrap() {
            Command::BatchInsertReservations { reservations } => {
                assert_eq!(reservations.len(), 2);
                assert_eq!(reservations[1].id, second);
                assert_eq!(reservations[1].start_time, t("12:00"));
            }
            other => panic!("expected BatchInsertReservations, got {other:?}"),
        }
    }

    #[test]
    fn batch_error_names_row() {
        let sql = format!(
            "INSERT INTO reservations (id, court_id, booking_date, start_time, end_time, sport_id, payment_method_id, total_amount) VALUES \
             ('{RES}', '{COURT}', '2024-05-10', '08:00', '09:00', 'tennis', NULL, 100), \
             ('{RES}', '{COURT}', '2024-13-10', '12:00', '13:00', 'tennis', NULL, 100)"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.is_bad_value());
        assert!(err.to_string().starts_with("row 1: invalid value for booking_date"), "{err}");
    }

    #[test]
    fn wrong_value_count_rejected() {
        let sql = format!("INSERT INTO courts (id, name) VALUES ('{COURT}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(2, 1))));
    }

    #[test]
    fn missing_required_column() {
        let sql = format!("INSERT INTO reservations (id, court_id) VALUES ('{RES}', '{COURT}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("booking_date"))));
    }

    #[test]
    fn parse_cancel_and_confirm() {
        let cmd = parse_sql(&format!("DELETE FROM reservations WHERE id = '{RES}'")).unwrap();
        assert_eq!(cmd, Command::CancelReservation { id: RES.parse().unwrap() });
        let cmd = parse_sql(&format!("INSERT INTO confirmations (reservation_id) VALUES ('{RES}')")).unwrap();
        assert_eq!(cmd, Command::ConfirmReservation { id: RES.parse().unwrap() });
    }

    #[test]
    fn parse_select_reservations() {
        let cmd = parse_sql(&format!("SELECT * FROM reservations WHERE court_id = '{COURT}'")).unwrap();
        assert_eq!(cmd, Command::SelectReservations { court_id: COURT.parse().unwrap(), date: None });
        let cmd = parse_sql(&format!(
            "SELECT * FROM reservations WHERE court_id = '{COURT}' AND booking_date = '2024-05-10'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectReservations { court_id: COURT.parse().unwrap(), date: Some(date("2024-05-10")) }
        );
    }

    #[test]
    fn parse_select_slots() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM slots WHERE court_id = '{COURT}' AND booking_date = '2024-05-10' AND as_of = '2024-05-10T14:30:00'"
        ))
        .unwrap();
        match cmd {
            Command::SelectSlots { court_id, date: d, as_of } => {
                assert_eq!(court_id.to_string(), COURT);
                assert_eq!(d, date("2024-05-10"));
                assert_eq!(as_of, Some(t("14:30").on(date("2024-05-10"))));
            }
            other => panic!("expected SelectSlots, got {other:?}"),
        }
        let cmd = parse_sql(&format!(
            "SELECT * FROM slots WHERE (court_id = '{COURT}') AND booking_date = '2024-05-10'"
        ))
        .unwrap();
        assert!(matches!(cmd, Command::SelectSlots { as_of: None, .. }));
    }

    #[test]
    fn slots_require_date() {
        let err = parse_sql(&format!("SELECT * FROM slots WHERE court_id = '{COURT}'")).unwrap_err();
        assert!(matches!(err, SqlError::MissingFilter("booking_date")));
    }

    #[test]
    fn parse_recurrence_preview() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM recurrence_preview WHERE court_id = '{COURT}' AND base_date = '2024-01-01' \
             AND duration_days = 14 AND weekdays = '1,3' AND start_time = '18:00' AND end_time = '19:00' AND sport_id = 'tennis'"
        ))
        .unwrap();
        match cmd {
            Command::SelectRecurrencePreview { rule } => {
                assert_eq!(rule.court_id, Some(COURT.parse().unwrap()));
                assert_eq!(rule.base_date, Some(date("2024-01-01")));
                assert_eq!(rule.duration_days, 14);
                assert_eq!(rule.weekdays, [1u8, 3].into_iter().collect());
                assert_eq!(rule.start_time, Some(t("18:00")));
                assert_eq!(rule.end_time, Some(t("19:00")));
                assert_eq!(rule.sport_id, "tennis");
                assert_eq!(rule.frequency, RecurrenceFrequency::Weekly);
            }
            other => panic!("expected SelectRecurrencePreview, got {other:?}"),
        }
    }

    #[test]
    fn recurrence_preview_with_months_and_daily() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM recurrence_preview WHERE court_id = '{COURT}' AND base_date = '2024-02-01' \
             AND duration_months = 1 AND start_time = '07:00' AND end_time = '08:00' AND sport_id = 'beach' AND frequency = 'daily'"
        ))
        .unwrap();
        match cmd {
            Command::SelectRecurrencePreview { rule } => {
                assert_eq!(rule.duration_days, 29);
                assert_eq!(rule.frequency, RecurrenceFrequency::Daily);
                assert!(rule.weekdays.is_empty());
            }
            other => panic!("expected SelectRecurrencePreview, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_recurrence_still_parses() {
        // The engine names the missing field.
        let cmd = parse_sql("SELECT * FROM recurrence_preview WHERE duration_days = 7").unwrap();
        match cmd {
            Command::SelectRecurrencePreview { rule } => {
                assert_eq!(rule.court_id, None);
                assert_eq!(rule.base_date, None);
            }
            other => panic!("expected SelectRecurrencePreview, got {other:?}"),
        }
    }

    #[test]
    fn parse_recurring_insert() {
        let sql = format!(
            "INSERT INTO recurring_reservations (court_id, base_date, duration_days, weekdays, start_time, end_time, sport_id, payment_method_id, total_amount) \
             VALUES ('{COURT}', '2024-01-01', 28, '2', '20:00', '21:00', 'futsal', 'card', 200)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRecurrence { rule, payment_method_id, total_amount } => {
                assert_eq!(rule.weekdays, [2u8].into_iter().collect());
                assert_eq!(rule.duration_days, 28);
                assert_eq!(payment_method_id.as_deref(), Some("card"));
                assert_eq!(total_amount, Some(Money(20_000)));
            }
            other => panic!("expected InsertRecurrence, got {other:?}"),
        }
    }

    #[test]
    fn recurring_insert_amount_is_optional() {
        let sql = format!(
            "INSERT INTO recurring_reservations (court_id, base_date, duration_days, weekdays, start_time, end_time, sport_id) \
             VALUES ('{COURT}', '2024-01-01', 28, '2', '20:00', '21:00', 'futsal')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRecurrence { total_amount, payment_method_id, .. } => {
                assert_eq!(total_amount, None);
                assert_eq!(payment_method_id, None);
            }
            other => panic!("expected InsertRecurrence, got {other:?}"),
        }
    }

    #[test]
    fn bad_weekday_list() {
        let err = parse_sql(&format!(
            "SELECT * FROM recurrence_preview WHERE court_id = '{COURT}' AND weekdays = 'mon'"
        ))
        .unwrap_err();
        assert!(matches!(err, SqlError::BadValue { column: "weekdays", .. }));
    }

    #[test]
    fn parse_peak_hours() {
        let cmd = parse_sql(&format!(
            "SELECT * FROM peak_hours WHERE court_id = '{COURT}' AND booking_date = '2024-05-10'"
        ))
        .unwrap();
        assert_eq!(cmd, Command::SelectPeakHours { court_id: COURT.parse().unwrap(), date: date("2024-05-10") });
    }

    #[test]
    fn parse_select_config_and_courts() {
        assert_eq!(parse_sql("SELECT * FROM config").unwrap(), Command::SelectConfig);
        assert_eq!(parse_sql("select * from COURTS").unwrap(), Command::SelectCourts);
    }

    #[test]
    fn parse_listen() {
        let cmd = parse_sql(&format!("LISTEN court_{COURT};")).unwrap();
        assert_eq!(cmd, Command::Listen { channel: format!("court_{COURT}") });
        let cmd = parse_sql(&format!("listen \"court_{COURT}\"")).unwrap();
        assert_eq!(cmd, Command::Listen { channel: format!("court_{COURT}") });
    }

    #[test]
    fn unsupported_filter_operator() {
        let err = parse_sql(&format!("SELECT * FROM reservations WHERE court_id > '{COURT}'")).unwrap_err();
        assert!(matches!(err, SqlError::Unsupported(_)));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO bookings (id) VALUES ('x')"),
            Err(SqlError::UnknownTable(t)) if t == "bookings"
        ));
        assert!(matches!(parse_sql("SELECT * FROM holds"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
