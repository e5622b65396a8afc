//! Page attachment and `Runtime.evaluate`-backed evaluation.

use std::sync::Arc;

use async_trait::async_trait;
use cipherscope_correlator::{EvalError, PageEvaluator};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{decode_error, AdapterError, AdapterErrorKind};
use crate::metrics::{self, EvaluationOutcome};
use crate::transport::{CdpTransport, CommandTarget};

/// How to choose the page to inspect.
#[derive(Clone, Debug, Default)]
pub struct TargetSelector {
    /// Attach to the first existing page whose URL contains this substring.
    pub url_contains: Option<String>,
    /// Navigate the attached page here once the capture script is registered.
    pub open_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    target_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetList {
    target_infos: Vec<TargetInfo>,
}

/// A flattened CDP session on one page target.
pub struct PageSession {
    transport: Arc<dyn CdpTransport>,
    target_id: String,
    session_id: String,
}

impl PageSession {
    /// Pick (or create) a page target and attach a flattened session to it.
    pub async fn attach(
        transport: Arc<dyn CdpTransport>,
        selector: &TargetSelector,
    ) -> Result<Self, AdapterError> {
        let target_id = match find_page(transport.as_ref(), selector).await? {
            Some(target_id) => target_id,
            None => create_page(transport.as_ref()).await?,
        };

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("attachToTarget returned no sessionId")
                    .with_data(attached.clone())
            })?
            .to_string();

        info!(target: "cdp-adapter", %target_id, %session_id, "attached to page");
        Ok(Self {
            transport,
            target_id,
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Enable the domains the inspector relies on and register a script for every new document.
    pub async fn prepare(&self, bootstrap: &str, capture_bodies: bool) -> Result<(), AdapterError> {
        let network_params = if capture_bodies {
            json!({
                "maxTotalBufferSize": 16 * 1024 * 1024,
                "maxResourceBufferSize": 4 * 1024 * 1024,
            })
        } else {
            json!({})
        };
        self.send("Network.enable", network_params).await?;
        self.send("Runtime.enable", json!({})).await?;
        self.send("Page.enable", json!({})).await?;
        self.send(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": bootstrap }),
        )
        .await?;
        debug!(target: "cdp-adapter", session = %self.session_id, "page domains enabled");
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        let reply = self.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = reply.get("errorText").and_then(Value::as_str) {
            return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("navigation to {url} failed: {error_text}")));
        }
        info!(target: "cdp-adapter", %url, "navigated page");
        Ok(())
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
    }

    async fn run_expression(&self, expression: &str) -> Result<Value, AdapterError> {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        evaluation_value(reply)
    }
}

async fn find_page(
    transport: &dyn CdpTransport,
    selector: &TargetSelector,
) -> Result<Option<String>, AdapterError> {
    let Some(needle) = selector.url_contains.as_deref() else {
        return Ok(None);
    };
    let reply = transport
        .send_command(CommandTarget::Browser, "Target.getTargets", json!({}))
        .await?;
    let list: TargetList = serde_json::from_value(reply).map_err(decode_error)?;
    let found = list
        .target_infos
        .into_iter()
        .find(|info| info.kind == "page" && info.url.contains(needle))
        .map(|info| info.target_id);
    if found.is_none() {
        debug!(target: "cdp-adapter", needle, "no existing page matched, creating one");
    }
    Ok(found)
}

async fn create_page(transport: &dyn CdpTransport) -> Result<String, AdapterError> {
    let reply = transport
        .send_command(
            CommandTarget::Browser,
            "Target.createTarget",
            json!({ "url": "about:blank" }),
        )
        .await?;
    reply
        .get("targetId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::new(AdapterErrorKind::TargetNotFound)
                .with_hint("createTarget returned no targetId")
        })
}

/// Unwrap a `Runtime.evaluate` reply into its by-value result.
fn evaluation_value(reply: Value) -> Result<Value, AdapterError> {
    if let Some(details) = reply.get("exceptionDetails") {
        let description = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("uncaught exception");
        return Err(AdapterError::new(AdapterErrorKind::Evaluation)
            .with_hint(description.to_string())
            .with_data(details.clone()));
    }
    Ok(reply
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

#[async_trait]
impl PageEvaluator for PageSession {
    async fn evaluate(&self, expression: &str) -> Result<Value, EvalError> {
        let result = self.run_expression(expression).await.map_err(|err| match err.kind {
            AdapterErrorKind::Evaluation => {
                EvalError::Exception(err.hint.unwrap_or_else(|| err.kind.to_string()))
            }
            _ => EvalError::Unavailable(err.to_string()),
        });
        metrics::record_evaluation(match &result {
            Ok(_) => EvaluationOutcome::Value,
            Err(EvalError::Exception(_)) => EvaluationOutcome::Exception,
            Err(EvalError::Unavailable(_)) => EvaluationOutcome::Unavailable,
        });
        result
    }
}
