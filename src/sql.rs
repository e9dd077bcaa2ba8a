use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectServers {
        id: Option<ServerId>,
    },
    InsertServer {
        server: NewServer,
    },
    UpdateServer {
        id: ServerId,
        patch: ServerPatch,
    },
    DeleteServer {
        id: ServerId,
    },
    SelectReservations {
        id: Option<ReservationId>,
    },
    InsertReservation {
        server_id: ServerId,
        start: Ms,
        end: Ms,
    },
    /// Columns left out keep their current value.
    UpdateReservation {
        id: ReservationId,
        server_id: Option<ServerId>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    CancelReservation {
        id: ReservationId,
    },
    DeleteReservation {
        id: ReservationId,
    },
    SelectUsers,
    InsertUser {
        username: String,
        password: Option<String>,
        role: Role,
    },
    SetPassword {
        id: UserId,
        password: String,
    },
    UpdateUserRole {
        id: UserId,
        role: Role,
    },
    DeleteUser {
        id: UserId,
    },
    Whoami,
}

/// Tables a statement can address; drives the result schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Servers,
    Reservations,
    Users,
    Whoami,
}

impl Table {
    fn from_name(name: String) -> Result<Table, SqlError> {
        match name.as_str() {
            "servers" => Ok(Table::Servers),
            "reservations" => Ok(Table::Reservations),
            "users" => Ok(Table::Users),
            "whoami" => Ok(Table::Whoami),
            _ => Err(SqlError::UnknownTable(name)),
        }
    }
}

/// Table whose rows a statement returns, judged from its shape alone so
/// unbound `$n` placeholders don't matter. Cancels and deletes return none.
pub fn result_table(sql: &str) -> Option<Table> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let table = match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Update {
            table, assignments, ..
        } => {
            let sets_status = assignments.iter().any(|a| match &a.target {
                AssignmentTarget::ColumnName(name) => {
                    object_name_last(name).as_deref() == Some("status")
                }
                AssignmentTarget::Tuple(_) => false,
            });
            let name = table_factor_name(&table.relation).ok()?;
            if sets_status && name == "reservations" {
                return None;
            }
            name
        }
        _ => return None,
    };
    Table::from_name(table).ok()
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
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::from_name(insert_table_name(insert)?)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();
    if columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }
    let pairs: Vec<(&str, &Expr)> = columns.iter().map(String::as_str).zip(values.iter()).collect();

    match table {
        Table::Servers => {
            let mut server = NewServer::default();
            let mut name = None;
            for (col, expr) in pairs {
                match col {
                    "name" => name = Some(parse_string(expr)?),
                    "address" => server.connection.address = parse_string_or_null(expr)?,
                    "login" => server.connection.login = parse_string_or_null(expr)?,
                    "secret" => server.connection.secret = parse_string_or_null(expr)?,
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            server.name = name.ok_or(SqlError::MissingColumn("name"))?;
            Ok(Command::InsertServer { server })
        }
        Table::Reservations => {
            let (mut server_id, mut start, mut end) = (None, None, None);
            for (col, expr) in pairs {
                match col {
                    "server_id" => server_id = Some(parse_i64_expr(expr)?),
                    "start" => start = Some(parse_timestamp(expr)?),
                    "end" => end = Some(parse_timestamp(expr)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::InsertReservation {
                server_id: server_id.ok_or(SqlError::MissingColumn("server_id"))?,
                start: start.ok_or(SqlError::MissingColumn("start"))?,
                end: end.ok_or(SqlError::MissingColumn("end"))?,
            })
        }
        Table::Users => {
            let (mut username, mut password, mut role) = (None, None, Role::Ordinary);
            for (col, expr) in pairs {
                match col {
                    "username" => username = Some(parse_string(expr)?),
                    "password" => password = parse_string_or_null(expr)?,
                    "role" => role = parse_role(expr)?,
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::InsertUser {
                username: username.ok_or(SqlError::MissingColumn("username"))?,
                password,
                role,
            })
        }
        Table::Whoami => Err(SqlError::Unsupported("whoami is read-only".into())),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::from_name(table_factor_name(relation)?)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        pairs.push((col, &a.value));
    }

    match table {
        Table::Servers => {
            let mut patch = ServerPatch::default();
            for (col, expr) in pairs {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(expr)?),
                    "address" => patch.address = Some(parse_string_or_null(expr)?),
                    "login" => patch.login = Some(parse_string_or_null(expr)?),
                    "secret" => patch.secret = Some(parse_string_or_null(expr)?),
                    "status" => {
                        let status = parse_string(expr)?;
                        patch.maintenance = match status.to_lowercase().as_str() {
                            "maintenance" => Some(true),
                            "available" => Some(false),
                            _ => {
                                return Err(SqlError::Unsupported(format!(
                                    "server status can only be set to 'maintenance' or 'available', not {status:?}"
                                )));
                            }
                        };
                    }
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateServer { id, patch })
        }
        Table::Reservations => {
            if pairs.iter().any(|(col, _)| col == "status") {
                if pairs.len() != 1 {
                    return Err(SqlError::Unsupported(
                        "status must be updated on its own".into(),
                    ));
                }
                let status = parse_string(pairs[0].1)?;
                return match status.to_lowercase().as_str() {
                    "cancelled" | "canceled" => Ok(Command::CancelReservation { id }),
                    _ => Err(SqlError::Unsupported(format!(
                        "reservation status can only be set to 'cancelled', not {status:?}"
                    ))),
                };
            }
            let (mut server_id, mut start, mut end) = (None, None, None);
            for (col, expr) in pairs {
                match col.as_str() {
                    "server_id" => server_id = Some(parse_i64_expr(expr)?),
                    "start" => start = Some(parse_timestamp(expr)?),
                    "end" => end = Some(parse_timestamp(expr)?),
                    _ => return Err(SqlError::UnknownColumn(col)),
                }
            }
            Ok(Command::UpdateReservation {
                id,
                server_id,
                start,
                end,
            })
        }
        Table::Users => {
            let [(col, expr)] = pairs.as_slice() else {
                return Err(SqlError::Unsupported(
                    "set either role or password, one at a time".into(),
                ));
            };
            match col.as_str() {
                "role" => Ok(Command::UpdateUserRole {
                    id,
                    role: parse_role(expr)?,
                }),
                "password" => Ok(Command::SetPassword {
                    id,
                    password: parse_string(expr)?,
                }),
                _ => Err(SqlError::UnknownColumn(col.clone())),
            }
        }
        Table::Whoami => Err(SqlError::Unsupported("whoami is read-only".into())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::from_name(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Servers => Ok(Command::DeleteServer { id }),
        Table::Reservations => Ok(Command::DeleteReservation { id }),
        Table::Users => Ok(Command::DeleteUser { id }),
        Table::Whoami => Err(SqlError::Unsupported("whoami is read-only".into())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = Table::from_name(table_factor_name(&select.from[0].relation)?)?;
    let id = match &select.selection {
        Some(_) => Some(extract_where_id(&select.selection)?),
        None => None,
    };

    match table {
        Table::Servers => Ok(Command::SelectServers { id }),
        Table::Reservations => Ok(Command::SelectReservations { id }),
        Table::Users if id.is_none() => Ok(Command::SelectUsers),
        Table::Whoami if id.is_none() => Ok(Command::Whoami),
        Table::Users | Table::Whoami => Err(SqlError::Unsupported("filter not supported".into())),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_i64_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Integer Unix milliseconds, or an RFC 3339 string with an offset.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.trim().parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64_expr(expr)
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let text = parse_string(expr)?;
    Role::parse(&text).ok_or_else(|| SqlError::Parse(format!("unknown role {text:?}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Parse(_)
            | SqlError::Empty
            | SqlError::MissingColumn(_)
            | SqlError::MissingFilter(_) => "42601",
        }
    }
}
