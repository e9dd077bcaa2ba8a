use std::fmt::Debug;
use std::io;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::ReservdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError, Table};

pub struct ReservdHandler {
    engine: Arc<Engine>,
    auto_register: bool,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(engine: Arc<Engine>, auto_register: bool) -> Self {
        Self {
            engine,
            auto_register,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    /// The session user becomes the caller; its role is looked up per query so
    /// role changes apply immediately.
    async fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<(String, Caller)> {
        let username = client.metadata().get("user").cloned().unwrap_or_default();
        let caller = self
            .engine
            .resolve_caller(&username, self.auto_register)
            .await
            .map_err(engine_err)?;
        Ok((username, caller))
    }

    async fn run(&self, username: &str, caller: Caller, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            tracing::warn!(user = username, "rejected query: {e}");
            metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(caller, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => "ok").increment(1);
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(user = username, command = label, "rejected: {e}");
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => e.kind())
                    .increment(1);
                Err(engine_err(e))
            }
        }
    }

    async fn execute_command(&self, caller: Caller, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::SelectServers { id: None } => {
                let servers = engine.list_servers(caller).await;
                Ok(server_rows(&servers))
            }
            Command::SelectServers { id: Some(id) } => {
                let server = engine.get_server(caller, id).await?;
                Ok(server_rows(&[server]))
            }
            Command::InsertServer { server } => {
                let created = engine.create_server(caller, server).await?;
                Ok(server_rows(&[created]))
            }
            Command::UpdateServer { id, patch } => {
                let updated = engine.update_server(caller, id, patch).await?;
                Ok(server_rows(&[updated]))
            }
            Command::DeleteServer { id } => {
                engine.delete_server(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { id: None } => {
                let reservations = engine.list_reservations(caller).await;
                Ok(reservation_rows(&reservations))
            }
            Command::SelectReservations { id: Some(id) } => {
                let reservation = engine.get_reservation(caller, id).await?;
                Ok(reservation_rows(&[reservation]))
            }
            Command::InsertReservation {
                server_id,
                start,
                end,
            } => {
                let created = engine
                    .create_reservation(caller, server_id, start, end)
                    .await?;
                Ok(reservation_rows(&[created]))
            }
            Command::UpdateReservation {
                id,
                server_id,
                start,
                end,
            } => {
                let patch = ReservationPatch {
                    server_id,
                    start,
                    end,
                };
                let updated = engine.patch_reservation(caller, id, patch).await?;
                Ok(reservation_rows(&[updated]))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(caller, id).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers => {
                let accounts = engine.list_accounts(caller)?;
                Ok(account_rows(Table::Users, &accounts))
            }
            Command::InsertUser {
                username,
                password,
                role,
            } => {
                let account = engine
                    .create_account(caller, &username, password.as_deref(), role)
                    .await?;
                Ok(account_rows(Table::Users, &[account]))
            }
            Command::SetPassword { id, password } => {
                let account = engine.set_password(caller, id, &password).await?;
                Ok(account_rows(Table::Users, &[account]))
            }
            Command::UpdateUserRole { id, role } => {
                let account = engine.set_role(caller, id, role).await?;
                Ok(account_rows(Table::Users, &[account]))
            }
            Command::DeleteUser { id } => {
                engine.delete_account(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Whoami => {
                let me = engine.whoami(caller)?;
                Ok(account_rows(Table::Whoami, &[me]))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn server_schema() -> Vec<FieldInfo> {
    vec![
        int8("id"),
        varchar("name"),
        varchar("status"),
        varchar("address"),
        varchar("login"),
        varchar("secret"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        int8("id"),
        int8("server_id"),
        varchar("server_name"),
        int8("user_id"),
        varchar("username"),
        int8("start"),
        int8("end"),
        varchar("status"),
        varchar("address"),
        varchar("login"),
        varchar("secret"),
    ]
}

fn account_schema() -> Vec<FieldInfo> {
    vec![int8("id"), varchar("username"), varchar("role")]
}

fn schema_for(table: Option<Table>) -> Vec<FieldInfo> {
    match table {
        Some(Table::Servers) => server_schema(),
        Some(Table::Reservations) => reservation_schema(),
        Some(Table::Users) | Some(Table::Whoami) => account_schema(),
        None => Vec::new(),
    }
}

/// Result schema for a statement, used by Describe. Unparsable statements
/// describe as no rows; the error surfaces on execute.
fn describe(sql: &str) -> Vec<FieldInfo> {
    schema_for(sql::result_table(sql))
}

fn server_rows(servers: &[ServerInfo]) -> Response {
    let schema = Arc::new(server_schema());
    let rows: Vec<PgWireResult<_>> = servers
        .iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id)?;
            encoder.encode_field(&s.name)?;
            encoder.encode_field(&s.status.as_str())?;
            encoder.encode_field(&s.address)?;
            encoder.encode_field(&s.login)?;
            encoder.encode_field(&s.secret)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: &[ReservationInfo]) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let connection = r.connection.clone().unwrap_or_default();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id)?;
            encoder.encode_field(&r.server_id)?;
            encoder.encode_field(&r.server_name)?;
            encoder.encode_field(&r.user_id)?;
            encoder.encode_field(&r.username)?;
            encoder.encode_field(&r.start)?;
            encoder.encode_field(&r.end)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&connection.address)?;
            encoder.encode_field(&connection.login)?;
            encoder.encode_field(&connection.secret)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn account_rows(table: Table, accounts: &[AccountInfo]) -> Response {
    let schema = Arc::new(schema_for(Some(table)));
    let rows: Vec<PgWireResult<_>> = accounts
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id)?;
            encoder.encode_field(&a.username)?;
            encoder.encode_field(&a.role.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (username, caller) = self.resolve_caller(client).await?;
        let response = self.run(&username, caller, query).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

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
        let (username, caller) = self.resolve_caller(client).await?;
        let sql = substitute_params(portal);
        self.run(&username, caller, &sql).await
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
            describe(&target.statement),
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so `$1` never clobbers `$10`.
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

#[derive(Clone)]
pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ReservdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(engine: Arc<Engine>, password: String, auto_register: bool) -> Self {
        let auth_source = ReservdAuthSource::new(engine.clone(), password, auto_register);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(engine, auto_register)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
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
    factory: ReservdFactory,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM servers"), 0);
        assert_eq!(
            count_params(r#"INSERT INTO reservations (server_id, start, "end") VALUES ($1, $2, $3)"#),
            3
        );
        assert_eq!(count_params("SELECT * FROM servers WHERE id = $12"), 12);
    }

    #[test]
    fn describe_matches_command_table() {
        assert_eq!(describe("SELECT * FROM servers").len(), 6);
        assert_eq!(describe("SELECT * FROM reservations WHERE id = $1").len(), 11);
        assert_eq!(describe("SELECT * FROM whoami").len(), 3);
        assert!(describe("DELETE FROM servers WHERE id = 1").is_empty());
        assert!(describe("garbage").is_empty());
    }
}
