use std::sync::Arc;

use futures::future::BoxFuture;

use super::config::ConnectionConfig;
use super::driver::{
    Pool, PoolFactory, RawResponse, Record, Request, StatementKind, TransactionHandle,
};
use super::registry::PoolRegistry;
use crate::ast::{
    compile_create_table, compile_drop_table, compile_select, SelectQuery, TableSchema, Value,
};
use crate::error::{CompileError, Error, Result};

/// Statement that reads the last identity generated on the current connection.
pub const IDENTITY_SQL: &str = "select @@identity as insertId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    InTransaction,
    Released,
}

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryData {
    #[default]
    None,
    Records(Vec<Record>),
    RecordSets(Vec<Vec<Record>>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub affected_rows: u64,
    pub data: QueryData,
    /// Last identity value, for inserts.
    pub insert_id: Option<serde_json::Value>,
}

impl QueryOutcome {
    pub fn from_raw(raw: RawResponse) -> Self {
        let affected_rows = raw.rows_affected.iter().sum();
        let mut recordsets = raw.recordsets;
        let data = match recordsets.len() {
            0 => QueryData::None,
            1 => QueryData::Records(recordsets.pop().unwrap_or_default()),
            _ => QueryData::RecordSets(recordsets),
        };
        Self {
            affected_rows,
            data,
            insert_id: None,
        }
    }

    /// Rows of the first result set, or nothing.
    pub fn records(&self) -> &[Record] {
        match &self.data {
            QueryData::None => &[],
            QueryData::Records(rows) => rows,
            QueryData::RecordSets(sets) => sets.first().map(Vec::as_slice).unwrap_or_default(),
        }
    }
}

/// Rewrite each `?` placeholder into a named parameter, left to right.
///
/// Question marks inside string literals and bracketed identifiers are left
/// alone. Names are 1-based: `@P1`, `@P2`, ...
pub fn bind_params(
    sql: &str,
    bindings: &[Value],
) -> std::result::Result<(String, Vec<(String, Value)>), CompileError> {
    let mut out = String::with_capacity(sql.len() + bindings.len() * 3);
    let mut names = Vec::new();
    let mut in_string = false;
    let mut in_bracket = false;

    for ch in sql.chars() {
        match ch {
            '\'' if !in_bracket => in_string = !in_string,
            '[' if !in_string => in_bracket = true,
            ']' if !in_string => in_bracket = false,
            '?' if !in_string && !in_bracket => {
                let name = format!("P{}", names.len() + 1);
                out.push('@');
                out.push_str(&name);
                names.push(name);
                continue;
            }
            _ => {}
        }
        out.push(ch);
    }

    if names.len() != bindings.len() {
        return Err(CompileError::BindingCount {
            placeholders: names.len(),
            bindings: bindings.len(),
        });
    }

    Ok((out, names.into_iter().zip(bindings.iter().cloned()).collect()))
}

/// One logical database session.
///
/// Holds at most one active request context. While a transaction is open the
/// previous context is parked and restored on commit or rollback.
pub struct Session {
    config: ConnectionConfig,
    registry: Arc<PoolRegistry>,
    factory: Arc<dyn PoolFactory>,
    pool: Option<Arc<dyn Pool>>,
    request: Option<Box<dyn Request>>,
    parked: Option<Box<dyn Request>>,
    transaction: Option<Box<dyn TransactionHandle>>,
    released: bool,
}

impl Session {
    /// A session backed by the process-wide pool registry.
    pub fn new(config: ConnectionConfig, factory: Arc<dyn PoolFactory>) -> Self {
        Self::with_registry(config, factory, PoolRegistry::global())
    }

    pub fn with_registry(
        config: ConnectionConfig,
        factory: Arc<dyn PoolFactory>,
        registry: Arc<PoolRegistry>,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            pool: None,
            request: None,
            parked: None,
            transaction: None,
            released: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.transaction.is_some() {
            SessionState::InTransaction
        } else if self.request.is_some() {
            SessionState::Connected
        } else if self.released {
            SessionState::Released
        } else {
            SessionState::Disconnected
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Acquire a request context, creating the pool on first use.
    pub async fn connect(&mut self) -> Result<()> {
        if self.request.is_some() {
            return Ok(());
        }
        let pool = self
            .registry
            .get_or_create(&self.config, self.factory.as_ref())
            .await?;
        self.request = Some(pool.request());
        self.pool = Some(pool);
        self.released = false;
        tracing::debug!("Session connected to {}", self.config.display_string());
        Ok(())
    }

    /// Execute `sql`, inferring the statement kind from its first keyword.
    pub async fn query(&mut self, sql: &str, bindings: &[Value]) -> Result<QueryOutcome> {
        self.query_as(sql, bindings, StatementKind::detect(sql)).await
    }

    /// Execute `sql` as a statement of the given kind.
    ///
    /// Inserts are followed by a read of the session's last identity value.
    pub async fn query_as(
        &mut self,
        sql: &str,
        bindings: &[Value],
        kind: StatementKind,
    ) -> Result<QueryOutcome> {
        let (sql, params) = bind_params(sql, bindings)?;

        if self.request.is_none() {
            self.connect().await?;
        }
        let request = self.request.as_mut().ok_or(Error::NotConnected)?;

        tracing::debug!(sql = %sql, params = params.len(), "Executing statement");
        let raw = request
            .execute(&sql, &params, kind)
            .await
            .map_err(|source| Error::query(&sql, source))?;
        let mut outcome = QueryOutcome::from_raw(raw);

        if kind == StatementKind::Insert {
            let raw = request
                .execute(IDENTITY_SQL, &[], StatementKind::Select)
                .await
                .map_err(|source| Error::query(IDENTITY_SQL, source))?;
            outcome.insert_id = raw
                .recordsets
                .first()
                .and_then(|rows| rows.first())
                .and_then(|row| row.get("insertId"))
                .cloned();
        }

        Ok(outcome)
    }

    /// Compile and run a select descriptor with its bindings.
    pub async fn fetch(&mut self, query: &SelectQuery) -> Result<QueryOutcome> {
        let sql = compile_select(query)?;
        self.query_as(&sql, &query.bindings, StatementKind::Select)
            .await
    }

    pub async fn create_table(&mut self, table: &TableSchema) -> Result<QueryOutcome> {
        let sql = compile_create_table(table)?;
        self.query_as(&sql, &[], StatementKind::Other).await
    }

    pub async fn drop_table(&mut self, name: &str) -> Result<QueryOutcome> {
        self.query_as(&compile_drop_table(name), &[], StatementKind::Other)
            .await
    }

    /// Begin a transaction and route subsequent statements through it.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::TransactionActive);
        }
        if self.pool.is_none() || self.request.is_none() {
            self.connect().await?;
        }
        let pool = self.pool.clone().ok_or(Error::NotConnected)?;

        let transaction = pool.begin().await.map_err(|source| Error::Transaction {
            action: "begin",
            source,
        })?;

        self.parked = self.request.take();
        self.request = Some(transaction.request());
        self.transaction = Some(transaction);
        tracing::debug!("Transaction started");
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        let transaction = self.transaction.take().ok_or(Error::NoTransaction)?;
        let result = transaction.commit().await;
        self.restore_context();
        result.map_err(|source| Error::Transaction {
            action: "commit",
            source,
        })?;
        tracing::debug!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let transaction = self.transaction.take().ok_or(Error::NoTransaction)?;
        let result = transaction.rollback().await;
        self.restore_context();
        result.map_err(|source| Error::Transaction {
            action: "rollback",
            source,
        })?;
        tracing::debug!("Transaction rolled back");
        Ok(())
    }

    fn restore_context(&mut self) {
        self.request = self.parked.take();
    }

    /// Run `body` inside a transaction.
    ///
    /// Commits when the body succeeds. On failure the transaction is rolled
    /// back and the body's error is returned; if the rollback fails as well,
    /// both errors are reported through [`Error::Rollback`].
    ///
    /// ```ignore
    /// let id = session
    ///     .transaction(|s| Box::pin(async move {
    ///         let sql = "insert into [users] ([name]) values (?)";
    ///         let out = s.query(sql, &["Ayon".into()]).await?;
    ///         Ok(out.insert_id)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T>>,
    {
        self.begin_transaction().await?;

        match body(self).await {
            Ok(value) => {
                if self.transaction.is_some() {
                    self.commit().await?;
                }
                Ok(value)
            }
            Err(cause) => {
                if self.transaction.is_none() {
                    return Err(cause);
                }
                tracing::debug!("Transaction body failed, rolling back: {}", cause);
                match self.rollback().await {
                    Ok(()) => Err(cause),
                    Err(rollback) => Err(Error::Rollback {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    }),
                }
            }
        }
    }

    /// Detach the current request context. The pool stays open.
    ///
    /// An open transaction is dropped, which rolls it back.
    pub fn release(&mut self) {
        if self.transaction.take().is_some() {
            tracing::warn!("Releasing session with an open transaction; rolling it back");
        }
        self.parked = None;
        self.request = None;
        self.pool = None;
        self.released = true;
    }
}

/// Close every pool in the process-wide registry.
pub async fn close_all() {
    PoolRegistry::global().close_all().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::apply_limit;
    use crate::db::testing::{record, MockFactory};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn session(factory: &MockFactory) -> Session {
        Session::with_registry(
            ConnectionConfig::default(),
            Arc::new(factory.clone()),
            Arc::new(PoolRegistry::new()),
        )
    }

    #[test]
    fn test_bind_params_in_order() {
        let (sql, params) = bind_params(
            "select * from [users] where [id] = ? and [name] = ?",
            &[Value::Int(1), Value::from("Ayon")],
        )
        .unwrap();
        assert_eq!(sql, "select * from [users] where [id] = @P1 and [name] = @P2");
        assert_eq!(
            params,
            vec![
                ("P1".to_string(), Value::Int(1)),
                ("P2".to_string(), Value::Text("Ayon".into()))
            ]
        );
    }

    #[test]
    fn test_bind_params_skips_literals_and_identifiers() {
        let (sql, params) = bind_params(
            "select '?', [what?] from [t] where [a] = ? and [b] = 'it''s?'",
            &[Value::Int(7)],
        )
        .unwrap();
        assert_eq!(sql, "select '?', [what?] from [t] where [a] = @P1 and [b] = 'it''s?'");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_bind_params_count_mismatch() {
        assert_eq!(
            bind_params("select ? , ?", &[Value::Int(1)]),
            Err(CompileError::BindingCount {
                placeholders: 2,
                bindings: 1
            })
        );
    }

    #[test]
    fn test_outcome_normalization() {
        let single = QueryOutcome::from_raw(RawResponse {
            rows_affected: vec![2],
            recordsets: vec![vec![record(&[("id", json!(1))]), record(&[("id", json!(2))])]],
        });
        assert_eq!(single.affected_rows, 2);
        assert!(matches!(single.data, QueryData::Records(ref rows) if rows.len() == 2));

        let multi = QueryOutcome::from_raw(RawResponse {
            rows_affected: vec![1, 1],
            recordsets: vec![vec![record(&[("a", json!(1))])], vec![record(&[("b", json!(2))])]],
        });
        assert!(matches!(multi.data, QueryData::RecordSets(ref sets) if sets.len() == 2));
        assert_eq!(multi.records()[0]["a"], json!(1));

        let dml = QueryOutcome::from_raw(RawResponse {
            rows_affected: vec![3],
            recordsets: vec![],
        });
        assert_eq!(dml.affected_rows, 3);
        assert_eq!(dml.data, QueryData::None);
        assert!(dml.records().is_empty());
    }

    #[tokio::test]
    async fn test_query_connects_lazily() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        assert_eq!(session.state(), SessionState::Disconnected);

        factory.respond(RawResponse {
            rows_affected: vec![1],
            recordsets: vec![vec![record(&[("name", json!("Ayon Lee"))])]],
        });
        let out = session
            .query("select [name] from [users] where [id] = ?", &[Value::Int(1)])
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(factory.created(), 1);
        assert_eq!(out.records()[0]["name"], json!("Ayon Lee"));
        assert_eq!(out.insert_id, None);

        let state = factory.state();
        assert_eq!(state.executed[0].sql, "select [name] from [users] where [id] = @P1");
        assert_eq!(state.executed[0].params, vec![("P1".to_string(), Value::Int(1))]);
    }

    #[tokio::test]
    async fn test_binding_error_happens_before_io() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        let err = session.query("select ?", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::BindingCount { .. })));
        assert_eq!(factory.created(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_insert_reads_identity_on_same_context() {
        let factory = MockFactory::new();
        factory.state().identity = 100;
        let mut session = session(&factory);

        let out = session
            .query(
                "insert into [users] ([name]) values (?)",
                &[Value::from("Ayon Lee")],
            )
            .await
            .unwrap();

        assert_eq!(out.affected_rows, 1);
        assert_eq!(out.insert_id, Some(json!(100)));
        let state = factory.state();
        assert_eq!(state.executed.len(), 2);
        assert_eq!(state.executed[1].sql, IDENTITY_SQL);
        assert_eq!(state.executed[0].context, state.executed[1].context);
    }

    #[tokio::test]
    async fn test_query_error_keeps_session_connected() {
        let factory = MockFactory::new();
        factory.fail_on("[missing]", "Invalid object name 'missing'.");
        let mut session = session(&factory);

        let err = session.query("select * from [missing]", &[]).await.unwrap_err();
        match &err {
            Error::Query { sql, source } => {
                assert_eq!(sql, "select * from [missing]");
                assert_eq!(source.message, "Invalid object name 'missing'.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Connected);

        session.query("select 1", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_compiles_pagination() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        let query = apply_limit(
            SelectQuery::new("users").filter("[age] > ?").bind(18).order("[id]"),
            5,
            Some(10),
        );

        session.fetch(&query).await.unwrap();

        assert_eq!(
            factory.executed_sql(),
            vec![
                "select * from (select *, row_number() over(order by [id]) [_rn] from [users] \
                 where [age] > @P1) tmp where tmp.[_rn] > 10 and tmp.[_rn] <= 15"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_create_and_drop_table() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        let mut table = TableSchema::new("articles");
        table.add_column(crate::ast::FieldDef::new("id").primary().auto_increment(100));

        session.create_table(&table).await.unwrap();
        session.drop_table("articles").await.unwrap();

        let sql = factory.executed_sql();
        assert!(sql[0].starts_with("create table [articles]"));
        assert_eq!(sql[1], "drop table [articles]");
    }

    #[tokio::test]
    async fn test_transaction_commits_and_restores_context() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        session.connect().await.unwrap();

        let id = session
            .transaction(|s| {
                Box::pin(async move {
                    assert_eq!(s.state(), SessionState::InTransaction);
                    let out = s
                        .query("insert into [users] ([name]) values (?)", &["a".into()])
                        .await?;
                    Ok(out.insert_id)
                })
            })
            .await
            .unwrap();
        assert_eq!(id, Some(json!(1)));

        session.query("select 1", &[]).await.unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        let state = factory.state();
        assert_eq!((state.begun, state.committed, state.rolled_back), (1, 1, 0));
        let contexts: Vec<&str> = state.executed.iter().map(|e| e.context.as_str()).collect();
        assert_eq!(contexts, vec!["tx1", "tx1", "pool"]);
    }

    #[tokio::test]
    async fn test_transaction_failure_rolls_back_and_returns_cause() {
        let factory = MockFactory::new();
        factory.fail_on("[broken]", "constraint violation");
        let mut session = session(&factory);
        session.connect().await.unwrap();

        let err = session
            .transaction(|s| {
                Box::pin(async move {
                    s.query("update [users] set [x] = 1", &[]).await?;
                    s.query("update [broken] set [x] = 1", &[]).await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Query { .. }));
        assert!(err.to_string().contains("constraint violation"));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.in_transaction());
        let state = factory.state();
        assert_eq!((state.committed, state.rolled_back), (0, 1));
    }

    #[tokio::test]
    async fn test_transaction_rollback_failure_reports_both() {
        let factory = MockFactory::new();
        factory.state().fail_rollback = Some("connection reset".into());
        let mut session = session(&factory);

        let err = session
            .transaction(|_s| {
                Box::pin(async move {
                    let source = crate::error::DriverError::new("body failed");
                    Err::<(), _>(Error::query("x", source))
                })
            })
            .await
            .unwrap_err();

        match err {
            Error::Rollback { cause, rollback } => {
                assert!(cause.to_string().contains("body failed"));
                assert!(rollback.to_string().contains("connection reset"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_manual_transaction() {
        let factory = MockFactory::new();
        let mut session = session(&factory);

        session.begin_transaction().await.unwrap();
        assert!(matches!(
            session.begin_transaction().await,
            Err(Error::TransactionActive)
        ));
        session.query("delete from [users]", &[]).await.unwrap();
        session.rollback().await.unwrap();

        assert!(matches!(session.commit().await, Err(Error::NoTransaction)));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(factory.state().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_still_restores_context() {
        let factory = MockFactory::new();
        factory.state().fail_commit = Some("commit refused".into());
        let mut session = session(&factory);

        session.begin_transaction().await.unwrap();
        let err = session.commit().await.unwrap_err();

        assert!(matches!(err, Error::Transaction { action: "commit", .. }));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_release_and_reconnect_reuses_pool() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        session.connect().await.unwrap();

        session.release();
        assert_eq!(session.state(), SessionState::Released);

        session.query("select 1", &[]).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.state().requests_minted, 2);
        assert_eq!(factory.state().closed_pools, 0);
    }

    #[tokio::test]
    async fn test_release_drops_open_transaction() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        session.begin_transaction().await.unwrap();
        session.query("delete from [users]", &[]).await.unwrap();

        session.release();

        assert_eq!(session.state(), SessionState::Released);
        let state = factory.state();
        assert_eq!(state.abandoned, 1);
        assert_eq!((state.committed, state.rolled_back), (0, 0));
    }

    #[tokio::test]
    async fn test_finished_transactions_are_not_abandoned() {
        let factory = MockFactory::new();
        let mut session = session(&factory);
        session.begin_transaction().await.unwrap();
        session.commit().await.unwrap();
        session.begin_transaction().await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(factory.state().abandoned, 0);
    }

    #[tokio::test]
    async fn test_sessions_share_pool_by_signature() {
        let factory = MockFactory::new().with_create_delay(10);
        let registry = Arc::new(PoolRegistry::new());
        let mut a = Session::with_registry(
            ConnectionConfig::default(),
            Arc::new(factory.clone()),
            registry.clone(),
        );
        let mut b = Session::with_registry(
            ConnectionConfig::default(),
            Arc::new(factory.clone()),
            registry.clone(),
        );

        let (ra, rb) = tokio::join!(a.connect(), b.connect());
        ra.unwrap();
        rb.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(registry.len(), 1);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(factory.state().closed_pools, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_session_disconnected() {
        let factory = MockFactory::new().failing_create("Login failed for user 'sa'.");
        let mut session = session(&factory);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(err.code(), Some(18456));
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
