//! Scripted in-memory driver used by the session and registry tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::config::PoolOptions;
use super::driver::{
    Pool, PoolFactory, RawResponse, Record, Request, StatementKind, TransactionHandle,
};
use crate::ast::Value;
use crate::error::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    /// `pool` for plain requests, `tx<n>` for requests bound to transaction n.
    pub context: String,
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub created_pools: usize,
    pub closed_pools: usize,
    pub requests_minted: usize,
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Transactions dropped without commit or rollback.
    pub abandoned: usize,
    pub executed: Vec<Executed>,
    pub responses: VecDeque<Result<RawResponse, String>>,
    pub fail_on: Vec<(String, String)>,
    pub fail_commit: Option<String>,
    pub fail_rollback: Option<String>,
    pub identity: i64,
}

#[derive(Clone)]
pub struct MockFactory {
    state: Arc<Mutex<MockState>>,
    create_delay_ms: u64,
    create_error: Option<String>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                identity: 1,
                ..Default::default()
            })),
            create_delay_ms: 0,
            create_error: None,
        }
    }

    pub fn with_create_delay(mut self, ms: u64) -> Self {
        self.create_delay_ms = ms;
        self
    }

    pub fn failing_create(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn created(&self) -> usize {
        self.state().created_pools
    }

    /// Queue the response for the next non-identity statement.
    pub fn respond(&self, response: RawResponse) {
        self.state().responses.push_back(Ok(response));
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(&self, needle: &str, message: &str) {
        self.state()
            .fail_on
            .push((needle.to_string(), message.to_string()));
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.state().executed.iter().map(|e| e.sql.clone()).collect()
    }
}

#[async_trait]
impl PoolFactory for MockFactory {
    async fn create(&self, _options: &PoolOptions) -> Result<Arc<dyn Pool>, DriverError> {
        if self.create_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.create_delay_ms)).await;
        }
        if let Some(message) = &self.create_error {
            return Err(DriverError::new(message.clone()).with_code(18456));
        }
        self.state().created_pools += 1;
        Ok(Arc::new(MockPool {
            state: self.state.clone(),
        }))
    }
}

struct MockPool {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Pool for MockPool {
    fn request(&self) -> Box<dyn Request> {
        self.state.lock().unwrap().requests_minted += 1;
        Box::new(MockRequest {
            state: self.state.clone(),
            context: "pool".to_string(),
        })
    }

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.begun += 1;
        Ok(Box::new(MockTransaction {
            state: self.state.clone(),
            context: format!("tx{}", state.begun),
            finished: false,
        }))
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed_pools += 1;
    }
}

struct MockRequest {
    state: Arc<Mutex<MockState>>,
    context: String,
}

#[async_trait]
impl Request for MockRequest {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[(String, Value)],
        kind: StatementKind,
    ) -> Result<RawResponse, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(Executed {
            context: self.context.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        if let Some((_, message)) = state.fail_on.iter().find(|(n, _)| sql.contains(n.as_str())) {
            return Err(DriverError::new(message.clone()));
        }

        if sql.starts_with("select @@identity") {
            let mut row = Record::new();
            row.insert("insertId".to_string(), json!(state.identity));
            state.identity += 1;
            return Ok(RawResponse {
                rows_affected: vec![1],
                recordsets: vec![vec![row]],
            });
        }

        if let Some(response) = state.responses.pop_front() {
            return response.map_err(DriverError::new);
        }

        Ok(if kind.returns_rows() {
            RawResponse {
                rows_affected: vec![0],
                recordsets: vec![Vec::new()],
            }
        } else {
            RawResponse {
                rows_affected: vec![1],
                recordsets: Vec::new(),
            }
        })
    }
}

struct MockTransaction {
    state: Arc<Mutex<MockState>>,
    context: String,
    finished: bool,
}

#[async_trait]
impl TransactionHandle for MockTransaction {
    fn request(&self) -> Box<dyn Request> {
        Box::new(MockRequest {
            state: self.state.clone(),
            context: self.context.clone(),
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        let mut this = self;
        {
            let mut state = this.state.lock().unwrap();
            if let Some(message) = &state.fail_commit {
                return Err(DriverError::new(message.clone()));
            }
            state.committed += 1;
        }
        this.finished = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        let mut this = self;
        {
            let mut state = this.state.lock().unwrap();
            if let Some(message) = &state.fail_rollback {
                return Err(DriverError::new(message.clone()));
            }
            state.rolled_back += 1;
        }
        this.finished = true;
        Ok(())
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.state.lock().unwrap().abandoned += 1;
        }
    }
}

/// Build a record from `(column, value)` pairs.
pub fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
