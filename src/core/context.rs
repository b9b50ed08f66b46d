//! Execution context identity
//!
//! Connections and sessions are partitioned by the logical unit of
//! concurrency that owns them. Callers thread an `ExecutionContextId`
//! through their calls instead of relying on a scheduler-assigned thread id,
//! so a task that resumes on another worker keeps its identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of an execution context (thread, task, request, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionContextId(u64);

impl ExecutionContextId {
    /// Mint a process-unique context id
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an identifier owned by the caller (request id, worker index, ...)
    ///
    /// Raw ids share the value space with minted ones; pick one scheme per
    /// process.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ExecutionContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}
