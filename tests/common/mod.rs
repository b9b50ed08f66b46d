//! Scripted driver for exercising connection loss and retries

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_session_pool::core::driver::{Driver, DriverLink, Statement, StatementOutcome};
use rust_session_pool::core::reader::ResultSet;
use rust_session_pool::{DatabaseType, DatabaseValue, DriverError, IsolationLevel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters and failure budgets shared by a driver and its links
#[derive(Default)]
pub struct Script {
    /// Opens attempted, failed ones included
    pub opens: AtomicUsize,
    /// Statements attempted
    pub runs: AtomicUsize,
    /// Upcoming opens that fail
    pub fail_opens: AtomicUsize,
    /// Upcoming runs that break the link
    pub break_runs: AtomicUsize,
    /// Upcoming runs that report an unusable link but leave it open
    pub unusable_open_runs: AtomicUsize,
    /// Upcoming runs that fail with a database error
    pub database_errors: AtomicUsize,
    /// Transaction control calls, in order
    pub control: Mutex<Vec<String>>,
    /// Last statement handed to a link
    pub last_statement: Mutex<Option<Statement>>,
}

impl Script {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn control(&self) -> Vec<String> {
        self.control.lock().clone()
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct ScriptedDriver {
    pub script: Arc<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn open(&self, _target: &rust_session_pool::ConnectionTarget) -> Result<Box<dyn DriverLink>, DriverError> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        if take(&self.script.fail_opens) {
            return Err(DriverError::Open("server unreachable".to_string()));
        }
        Ok(Box::new(ScriptedLink {
            script: Arc::clone(&self.script),
            open: true,
        }))
    }
}

pub struct ScriptedLink {
    script: Arc<Script>,
    open: bool,
}

impl ScriptedLink {
    fn record(&self, op: String) -> Result<(), DriverError> {
        if !self.open {
            return Err(DriverError::unusable("link closed"));
        }
        self.script.control.lock().push(op);
        Ok(())
    }
}

#[async_trait]
impl DriverLink for ScriptedLink {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.open = false;
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        self.record(format!("BEGIN {:?}", isolation))
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.record("COMMIT".to_string())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.record("ROLLBACK".to_string())
    }

    async fn save(&mut self, name: &str) -> Result<(), DriverError> {
        self.record(format!("SAVEPOINT {}", name))
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), DriverError> {
        self.record(format!("ROLLBACK TO {}", name))
    }

    async fn run(&mut self, statement: &Statement) -> Result<StatementOutcome, DriverError> {
        let attempt = self.script.runs.fetch_add(1, Ordering::SeqCst) + 1;
        *self.script.last_statement.lock() = Some(statement.clone());

        if take(&self.script.break_runs) {
            self.open = false;
            return Err(DriverError::unusable("connection reset by peer"));
        }
        if take(&self.script.unusable_open_runs) {
            return Err(DriverError::unusable("transport hiccup"));
        }
        if take(&self.script.database_errors) {
            return Err(DriverError::database("syntax error near 'SELEC'"));
        }

        let mut result = ResultSet::new(vec!["attempt".to_string()]);
        result.push_row(vec![DatabaseValue::Long(attempt as i64)]);
        let outputs = statement
            .parameters
            .iter()
            .filter(|p| p.is_output())
            .map(|p| (p.name.clone(), DatabaseValue::Long(42)))
            .collect();

        Ok(StatementOutcome {
            rows_affected: 1,
            result,
            outputs,
        })
    }
}
