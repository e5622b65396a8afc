//! Page-evaluation channel consumed by the bridge, the poller and the decryption invoker.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum EvalError {
    #[error("page raised an exception: {0}")]
    Exception(String),
    #[error("evaluation channel unavailable: {0}")]
    Unavailable(String),
}

/// Evaluates an expression in the inspected page's global context.
///
/// Implementations await promises and return the result by value; a missing result is
/// `Value::Null`. Completion order across concurrent calls is unspecified.
#[async_trait]
pub trait PageEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<Value, EvalError>;
}

/// Evaluate and collapse every failure into `None`; evaluation errors mean "no data".
pub async fn evaluate_or_none(evaluator: &dyn PageEvaluator, expression: &str) -> Option<Value> {
    match evaluator.evaluate(expression).await {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(target: "correlator", %err, "page evaluation yielded no data");
            None
        }
    }
}
