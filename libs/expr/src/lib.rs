//! Embedded expression language for content-based partitioning.
//!
//! Expressions are compiled once per source string into an AST and cached
//! for the lifetime of the process; evaluation binds the envelope's fields
//! and parsed FIX tags as variables. The language covers literals,
//! identifier and member/index access, arithmetic, comparison, logical
//! operators, the ternary, and an `if (…) { return …; }` statement form —
//! enough for partition-key and partition-number expressions without
//! embedding a scripting runtime.

mod eval;
mod lexer;
mod parser;
mod value;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use envelope::MessageEnvelope;
use tracing::{debug, warn};

pub use eval::Context;
pub use parser::Program;
pub use value::Value;

/// Errors from compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,
}

/// Thread-safe compile cache keyed by expression source.
///
/// Created at supervisor start and shared read-mostly by all workers; an
/// expression is compiled at most once per process lifetime. Evicted only on
/// process exit.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    programs: DashMap<String, Arc<Program>>,
    compilations: AtomicU64,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the compiled form of `source`, compiling on first use.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>, ExprError> {
        if let Some(program) = self.programs.get(source) {
            return Ok(Arc::clone(&program));
        }
        match self.programs.entry(source.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let program = Arc::new(parser::parse(source)?);
                self.compilations.fetch_add(1, Ordering::Relaxed);
                entry.insert(Arc::clone(&program));
                Ok(program)
            }
        }
    }

    /// Warm the cache at startup so no first-message latency spike is taken.
    /// Returns whether compilation succeeded.
    pub fn precompile(&self, source: &str) -> bool {
        if source.trim().is_empty() {
            return false;
        }
        match self.compile(source) {
            Ok(_) => true,
            Err(error) => {
                warn!(expression = source, %error, "failed to pre-compile expression");
                false
            }
        }
    }

    /// Number of distinct expressions compiled so far.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Evaluate `source` against an envelope and optional explicit tag map.
    ///
    /// An empty expression evaluates to `Null` with a warning, matching the
    /// permissive behaviour partition configuration relies on.
    pub fn evaluate(
        &self,
        source: &str,
        envelope: &MessageEnvelope,
        tags: Option<&HashMap<u32, String>>,
    ) -> Result<Value, ExprError> {
        if source.trim().is_empty() {
            warn!("empty expression provided for evaluation");
            return Ok(Value::Null);
        }
        let program = self.compile(source)?;
        let ctx = Context::for_envelope(envelope, tags);
        let result = program.eval(&ctx)?;
        debug!(expression = source, %result, "evaluated expression");
        Ok(result)
    }

    /// Evaluate a partition expression. A `Null` result is logged and means
    /// "no key": the partition strategy falls back to broker defaults.
    pub fn evaluate_partition_expression(
        &self,
        source: &str,
        envelope: &MessageEnvelope,
        tags: Option<&HashMap<u32, String>>,
    ) -> Result<Value, ExprError> {
        let result = self.evaluate(source, envelope, tags)?;
        if result == Value::Null {
            warn!(
                expression = source,
                "partition expression evaluated to null, using default routing"
            );
        }
        Ok(result)
    }
}
