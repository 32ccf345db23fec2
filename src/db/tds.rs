//! Tiberius-backed driver.
//!
//! Pools are `bb8::Pool<bb8_tiberius::ConnectionManager>`. A request context
//! checks out one pooled connection on first use and keeps it until dropped,
//! so `@@identity` reads land on the connection that ran the insert. A
//! transaction pins one connection for its whole lifetime; if it is dropped
//! without commit or rollback it is rolled back before the connection goes
//! back to the pool.
//!
//! Statements always run to completion: a TDS response that is abandoned
//! halfway leaves the connection unusable.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_tiberius::ConnectionManager;
use tiberius::{AuthMethod, ColumnData, Config, ToSql};
use tokio::sync::Mutex;

use super::config::{ConnectionConfig, PoolOptions, ServerOptions};
use super::driver::{
    Pool, PoolFactory, RawResponse, Record, Request, StatementKind, TransactionHandle,
};
use super::session::Session;
use crate::ast::Value;
use crate::error::DriverError;

type TdsPool = bb8::Pool<ConnectionManager>;
type TdsConnection = PooledConnection<'static, ConnectionManager>;

/// Rolls back whatever is still open on a connection, if anything.
const ABANDON_SQL: &str = "IF @@TRANCOUNT > 0 ROLLBACK";

/// A session that talks to a real SQL Server through the global registry.
pub fn session(config: ConnectionConfig) -> Session {
    Session::new(config, Arc::new(TdsFactory))
}

/// Builds bb8/tiberius pools from [`PoolOptions`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TdsFactory;

fn build_config(options: &ServerOptions) -> Config {
    let mut config = Config::new();
    config.host(&options.server);
    config.port(options.port);
    if !options.database.is_empty() {
        config.database(&options.database);
    }
    config.authentication(AuthMethod::sql_server(&options.user, &options.password));
    config.trust_cert();
    config
}

fn driver_error(err: impl std::error::Error + Send + Sync + 'static) -> DriverError {
    let code = server_code(&err.to_string());
    let mut driver = DriverError::new(err.to_string());
    driver.code = code;
    driver.with_source(err)
}

fn server_code(message: &str) -> Option<u32> {
    // Token errors render as "Token error: 'msg' on server X executing  on line N (code: 208, ...)"
    let start = message.find("code: ")? + "code: ".len();
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[async_trait]
impl PoolFactory for TdsFactory {
    async fn create(&self, options: &PoolOptions) -> Result<Arc<dyn Pool>, DriverError> {
        let (manager, limits) = match options {
            PoolOptions::ConnectionString(conn) => {
                let config = Config::from_ado_string(conn).map_err(driver_error)?;
                (ConnectionManager::new(config), None)
            }
            PoolOptions::Fields(fields) => (
                ConnectionManager::new(build_config(fields)),
                Some((fields.pool.clone(), fields.connection_timeout)),
            ),
        };

        let mut builder = bb8::Pool::builder();
        if let Some((pool, connection_timeout)) = limits {
            builder = builder
                .max_size(pool.max.max(1))
                .min_idle(Some(pool.min))
                .idle_timeout(Some(pool.idle_timeout))
                .connection_timeout(connection_timeout);
        }

        // Connects eagerly so bad credentials surface here, not on first query.
        let pool = builder
            .build(manager)
            .await
            .map_err(|e| DriverError::new(format!("Failed to create connection pool: {e}")))?;

        Ok(Arc::new(TdsPoolHandle {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct TdsPoolHandle {
    pool: TdsPool,
    closed: Arc<AtomicBool>,
}

impl TdsPoolHandle {
    async fn checkout(&self) -> Result<TdsConnection, DriverError> {
        checkout(&self.pool, &self.closed).await
    }
}

async fn checkout(pool: &TdsPool, closed: &AtomicBool) -> Result<TdsConnection, DriverError> {
    if closed.load(Ordering::Acquire) {
        return Err(DriverError::new("connection pool is closed"));
    }
    pool.get_owned()
        .await
        .map_err(|e| DriverError::new(format!("Failed to acquire connection: {e}")))
}

#[async_trait]
impl Pool for TdsPoolHandle {
    fn request(&self) -> Box<dyn Request> {
        Box::new(TdsRequest {
            pool: self.pool.clone(),
            closed: self.closed.clone(),
            conn: None,
        })
    }

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, DriverError> {
        let mut conn = self.checkout().await?;
        simple(&mut conn, "BEGIN TRANSACTION").await?;
        Ok(Box::new(TdsTransaction {
            conn: Arc::new(Mutex::new(conn)),
            finished: false,
        }))
    }

    async fn close(&self) {
        // bb8 drops idle connections once the last pool handle goes away.
        self.closed.store(true, Ordering::Release);
    }
}

struct TdsRequest {
    pool: TdsPool,
    closed: Arc<AtomicBool>,
    conn: Option<TdsConnection>,
}

#[async_trait]
impl Request for TdsRequest {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[(String, Value)],
        kind: StatementKind,
    ) -> Result<RawResponse, DriverError> {
        if self.conn.is_none() {
            self.conn = Some(checkout(&self.pool, &self.closed).await?);
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DriverError::new("no connection checked out"))?;
        run(conn, sql, params, kind).await
    }
}

struct TdsTransaction {
    conn: Arc<Mutex<TdsConnection>>,
    finished: bool,
}

#[async_trait]
impl TransactionHandle for TdsTransaction {
    fn request(&self) -> Box<dyn Request> {
        Box::new(TdsTransactionRequest {
            conn: self.conn.clone(),
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        let mut this = self;
        simple(&mut *this.conn.lock().await, "COMMIT").await?;
        this.finished = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        let mut this = self;
        simple(&mut *this.conn.lock().await, "ROLLBACK").await?;
        this.finished = true;
        Ok(())
    }
}

impl Drop for TdsTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut conn = conn.lock().await;
                    if let Err(e) = simple(&mut conn, ABANDON_SQL).await {
                        tracing::warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime to roll back an abandoned transaction"),
        }
    }
}

struct TdsTransactionRequest {
    conn: Arc<Mutex<TdsConnection>>,
}

#[async_trait]
impl Request for TdsTransactionRequest {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[(String, Value)],
        kind: StatementKind,
    ) -> Result<RawResponse, DriverError> {
        let mut conn = self.conn.lock().await;
        run(&mut conn, sql, params, kind).await
    }
}

async fn simple(conn: &mut TdsConnection, sql: &str) -> Result<(), DriverError> {
    conn.simple_query(sql)
        .await
        .map_err(driver_error)?
        .into_results()
        .await
        .map_err(driver_error)?;
    Ok(())
}

async fn run(
    conn: &mut TdsConnection,
    sql: &str,
    params: &[(String, Value)],
    kind: StatementKind,
) -> Result<RawResponse, DriverError> {
    let args: Vec<&dyn ToSql> = params.iter().map(|(_, v)| v as &dyn ToSql).collect();

    if kind.returns_rows() {
        let sets = conn
            .query(sql, &args)
            .await
            .map_err(driver_error)?
            .into_results()
            .await
            .map_err(driver_error)?;
        Ok(RawResponse {
            rows_affected: sets.iter().map(|rows| rows.len() as u64).collect(),
            recordsets: sets
                .iter()
                .map(|rows| rows.iter().map(convert_row).collect())
                .collect(),
        })
    } else {
        let result = conn.execute(sql, &args).await.map_err(driver_error)?;
        Ok(RawResponse {
            rows_affected: result.rows_affected().to_vec(),
            recordsets: Vec::new(),
        })
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Int(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::Text(s) => ColumnData::String(Some(s.as_str().into())),
        }
    }
}

fn convert_column(data: &ColumnData<'_>) -> serde_json::Value {
    use serde_json::Value as Json;
    match data {
        ColumnData::Bit(Some(b)) => Json::Bool(*b),
        ColumnData::U8(Some(v)) => Json::from(*v),
        ColumnData::I16(Some(v)) => Json::from(*v),
        ColumnData::I32(Some(v)) => Json::from(*v),
        ColumnData::I64(Some(v)) => Json::from(*v),
        ColumnData::F32(Some(v)) => Json::from(*v as f64),
        ColumnData::F64(Some(v)) => Json::from(*v),
        ColumnData::Numeric(Some(n)) => {
            Json::from(n.value() as f64 / 10f64.powi(n.scale() as i32))
        }
        ColumnData::String(Some(s)) => Json::String(s.to_string()),
        ColumnData::Guid(Some(g)) => Json::String(g.to_string()),
        ColumnData::Binary(Some(b)) => Json::from(b.to_vec()),
        ColumnData::Xml(Some(xml)) => Json::String(xml.to_string()),
        _ => Json::Null,
    }
}

fn convert_row(row: &tiberius::Row) -> Record {
    use serde_json::Value as Json;
    row.cells()
        .enumerate()
        .map(|(i, (column, data))| {
            let value = match data {
                ColumnData::DateTime(Some(_))
                | ColumnData::SmallDateTime(Some(_))
                | ColumnData::DateTime2(Some(_)) => row
                    .try_get::<chrono::NaiveDateTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Json::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                    .unwrap_or(Json::Null),
                ColumnData::DateTimeOffset(Some(_)) => row
                    .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Json::String(dt.to_rfc3339()))
                    .unwrap_or(Json::Null),
                ColumnData::Date(Some(_)) => row
                    .try_get::<chrono::NaiveDate, _>(i)
                    .ok()
                    .flatten()
                    .map(|d| Json::String(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Json::Null),
                ColumnData::Time(Some(_)) => row
                    .try_get::<chrono::NaiveTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|t| Json::String(t.format("%H:%M:%S%.f").to_string()))
                    .unwrap_or(Json::Null),
                _ => convert_column(data),
            };
            (column.name().to_string(), value)
        })
        .collect()
}
