use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;
use crate::util::extract_ws_url;

/// A decoded CDP event together with the flattened session it belongs to.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    /// Next event from the browser, or `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
}

type Responder = oneshot::Sender<Result<Value, AdapterError>>;

struct OutboundCommand {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: Responder,
}

/// Websocket link to a Chromium instance, either launched by us or already running.
pub struct ChromiumTransport {
    command_tx: mpsc::Sender<OutboundCommand>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    io_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
    deadline: Duration,
}

impl ChromiumTransport {
    pub async fn connect(cfg: &CdpConfig) -> Result<Self, AdapterError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => launch_browser(cfg).await?,
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(1024);

        let alive = Arc::new(AtomicBool::new(true));
        let io_alive = Arc::clone(&alive);
        let io_task = tokio::spawn(async move {
            let result = run_io(conn, command_rx, events_tx).await;
            io_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "cdp-transport", ?err, "transport loop terminated with error");
            }
        });

        let deadline = Duration::from_millis(cfg.default_deadline_ms);
        let heartbeat_task = spawn_heartbeat(
            command_tx.clone(),
            Arc::clone(&alive),
            Duration::from_millis(cfg.heartbeat_interval_ms),
            deadline,
        );

        info!(target: "cdp-transport", url = %ws_url, launched = child.is_some(), "chromium connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            io_task,
            heartbeat_task,
            child: Mutex::new(child),
            alive,
            deadline,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Stop the io loop and kill a browser we launched ourselves.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.io_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
            }
        }
    }

    async fn dispatch(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let command = OutboundCommand {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(command)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        match tokio::time::timeout(self.deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint("command response channel closed")),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("{method} timed out"))),
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let started = Instant::now();
        let result = self.dispatch(target, method, params).await;
        if let Err(err) = &result {
            debug!(target: "cdp-transport", method, %err, "cdp command failed");
        }
        metrics::record_command(method, started.elapsed(), result.is_ok());
        result
    }
}

impl Drop for ChromiumTransport {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.io_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }

        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
                        }
                    });
                } else {
                    debug!(target: "cdp-transport", "no tokio runtime available to kill chromium child");
                }
            }
        }
    }
}

fn spawn_heartbeat(
    sender: mpsc::Sender<OutboundCommand>,
    alive: Arc<AtomicBool>,
    every: Duration,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    let response_deadline = deadline.min(Duration::from_secs(5));

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;

            let (resp_tx, resp_rx) = oneshot::channel();
            let ping = OutboundCommand {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: json!({}),
                responder: resp_tx,
            };
            if sender.send(ping).await.is_err() {
                debug!(target: "cdp-transport", "heartbeat send failed (channel closed)");
                break;
            }

            match tokio::time::timeout(response_deadline, resp_rx).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-transport", %err, "heartbeat command error");
                    break;
                }
                Ok(Err(_)) => {
                    debug!(target: "cdp-transport", "heartbeat response channel closed");
                    break;
                }
                Err(_) => {
                    warn!(target: "cdp-transport", "heartbeat timed out");
                    break;
                }
            }
        }
    }))
}

fn resolve_profile_dir(cfg: &CdpConfig) -> Result<PathBuf, AdapterError> {
    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        let cwd = std::env::current_dir().map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("failed to resolve cwd for user-data-dir: {err}"))
        })?;
        cwd.join(&cfg.user_data_dir)
    };

    fs::create_dir_all(&profile_dir).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("failed to ensure user-data-dir: {err}"))
    })?;
    Ok(profile_dir)
}

fn browser_config(cfg: &CdpConfig) -> Result<BrowserConfig, AdapterError> {
    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!(
                "chrome executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set CIPHERSCOPE_CHROME to the full path of chrome/chromium."
            })));
    }

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_millis(cfg.launch_timeout_ms));

    if !cfg.headless {
        builder = builder.with_head();
    }

    if std::env::var("CIPHERSCOPE_DISABLE_SANDBOX")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }
    builder = builder.user_data_dir(resolve_profile_dir(cfg)?);

    builder.build().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("browser config error: {err}"))
    })
}

async fn launch_browser(cfg: &CdpConfig) -> Result<(Option<Child>, String), AdapterError> {
    let mut child = browser_config(cfg)?.launch().map_err(|err| {
        AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("failed to launch chromium: {err}"))
    })?;

    let ws_url = extract_ws_url(&mut child, Duration::from_millis(cfg.launch_timeout_ms))
        .await
        .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

    Ok((Some(child), ws_url))
}

async fn run_io(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<OutboundCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut pending: HashMap<CallId, Responder> = HashMap::new();

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                submit(&mut conn, command, &mut pending);
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        if let Some(responder) = pending.remove(&resp.id) {
                            let _ = responder.send(response_payload(resp));
                        }
                    }
                    Some(Ok(Message::Event(event))) => {
                        metrics::record_event();
                        match decode_event(event) {
                            Ok(decoded) => {
                                if event_tx.send(decoded).await.is_err() {
                                    debug!(target: "cdp-transport", "event receiver dropped");
                                }
                            }
                            Err(err) => warn!(target: "cdp-transport", %err, "failed to decode event"),
                        }
                    }
                    Some(Err(err)) => {
                        let adapter_err = map_cdp_error(err);
                        fail_pending(&mut pending, &adapter_err);
                        return Err(adapter_err);
                    }
                    None => {
                        let err = AdapterError::new(AdapterErrorKind::CdpIo)
                            .with_hint("cdp connection closed");
                        fail_pending(&mut pending, &err);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn submit(
    conn: &mut Connection<CdpEventMessage>,
    command: OutboundCommand,
    pending: &mut HashMap<CallId, Responder>,
) {
    let session = match command.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
    };

    let method_id: MethodId = command.method.into();
    match conn.submit_command(method_id, session, command.params) {
        Ok(call_id) => {
            pending.insert(call_id, command.responder);
        }
        Err(err) => {
            let _ = command
                .responder
                .send(Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string())));
        }
    }
}

fn fail_pending(pending: &mut HashMap<CallId, Responder>, err: &AdapterError) {
    for (_, responder) in pending.drain() {
        let _ = responder.send(Err(err.clone()));
    }
}

fn decode_event(event: CdpEventMessage) -> Result<TransportEvent, AdapterError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("failed to decode cdp event: {err}"))
    })?;

    Ok(TransportEvent {
        method: raw.method.into_owned(),
        params: raw.params,
        session_id: raw.session_id,
    })
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(protocol_error(error.code, &error.message)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

/// Error reply from the browser. Unknown sessions and targets are reported distinctly.
pub(crate) fn protocol_error(code: i64, message: &str) -> AdapterError {
    let lower = message.to_ascii_lowercase();
    let kind = if lower.contains("no target") || lower.contains("session with given id not found")
    {
        AdapterErrorKind::TargetNotFound
    } else {
        AdapterErrorKind::CdpIo
    };
    AdapterError::new(kind)
        .with_hint(format!("cdp error {code}: {message}"))
}

fn map_cdp_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout).with_hint(hint),
        CdpError::JavascriptException(_) => {
            AdapterError::new(AdapterErrorKind::Evaluation).with_hint(hint)
        }
        CdpError::Serde(_) => AdapterError::new(AdapterErrorKind::Internal).with_hint(hint),
        _ => AdapterError::new(AdapterErrorKind::CdpIo).with_hint(hint),
    }
}
