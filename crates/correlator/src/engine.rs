//! Session state and the actor that interleaves poll ticks, protocol records, drain
//! completions and decryption completions on a single logical thread.
//!
//! The actor task owns the record store and the correlation index, so neither needs locking.
//! Page evaluations (install, drain, decrypt) run as spawned tasks and report back over
//! channels. Every attach is write-once, which makes any completion order safe: a late or
//! repeated result can only fill an empty slot, never replace one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge;
use crate::config::CaptureConfig;
use crate::decrypt::{jobs_for, DecryptInvoker, DecryptJob, DecryptOutcome};
use crate::eval::PageEvaluator;
use crate::index::CorrelationIndex;
use crate::metrics;
use crate::model::{PlainEvent, ProtocolRecord, RecordId};
use crate::store::RecordStore;
use crate::CorrelatorError;

/// Notifications for the presentation layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreEvent {
    RecordAdded(RecordId),
    RecordUpdated(RecordId),
    /// The selected record may have new content and should be redrawn.
    Rerender(RecordId),
    Cleared,
}

pub struct Session {
    config: CaptureConfig,
    store: RecordStore,
    index: CorrelationIndex,
    events: broadcast::Sender<StoreEvent>,
}

impl Session {
    pub fn new(config: CaptureConfig, events: broadcast::Sender<StoreEvent>) -> Self {
        let index = CorrelationIndex::from_config(&config);
        Self {
            config,
            store: RecordStore::new(),
            index,
            events,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn index(&self) -> &CorrelationIndex {
        &self.index
    }

    fn notify(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    /// Accept a finished protocol record; returns the decryption jobs it warrants.
    pub fn on_record(&mut self, mut record: ProtocolRecord) -> Vec<DecryptJob> {
        if self.store.is_paused() {
            debug!(target: "correlator", url = %record.request.url, "paused; record dropped");
            return Vec::new();
        }
        metrics::record_protocol_record();
        self.index.attach(&mut record);
        let jobs = match self.config.active_decrypt_function() {
            Some(function) => jobs_for(&record, function, &self.config.ciphertext_field),
            None => Vec::new(),
        };
        let id = record.id;
        self.store.push(record);
        self.notify(StoreEvent::RecordAdded(id));
        if self.store.selected() == Some(id) {
            self.notify(StoreEvent::Rerender(id));
        }
        jobs
    }

    /// Ingest a drained batch and re-attach the most recent records.
    pub fn on_drained(&mut self, events: Vec<PlainEvent>) {
        if events.is_empty() {
            return;
        }
        metrics::record_plain_events(events.len());
        debug!(target: "correlator", count = events.len(), "plaintext events drained");
        self.index.ingest(events);

        let index = &self.index;
        let updated: Vec<RecordId> = self
            .store
            .recent_mut(self.config.rescan_window)
            .filter_map(|record| (!index.attach(record).is_empty()).then_some(record.id))
            .collect();
        for id in updated {
            self.notify(StoreEvent::RecordUpdated(id));
        }
        if let Some(selected) = self.store.selected() {
            self.notify(StoreEvent::Rerender(selected));
        }
    }

    pub fn on_decrypted(&mut self, outcome: DecryptOutcome) {
        let Some(value) = outcome.value else {
            return;
        };
        if self.store.attach_decrypted(outcome.record, outcome.side, value) {
            self.notify(StoreEvent::RecordUpdated(outcome.record));
            if self.store.selected() == Some(outcome.record) {
                self.notify(StoreEvent::Rerender(outcome.record));
            }
        }
    }

    /// Change the decryption function and re-apply it to every held record.
    pub fn set_decrypt_function(&mut self, function: Option<String>) -> Vec<DecryptJob> {
        self.config.decrypt_function = function;
        self.reapply_decryption()
    }

    pub fn set_decrypt_assist(&mut self, enabled: bool) -> Vec<DecryptJob> {
        self.config.decrypt_assist = enabled;
        self.reapply_decryption()
    }

    /// Switch to `function` and turn assist on in one step, so no job goes out with a stale name.
    pub fn enable_decryption(&mut self, function: String) -> Vec<DecryptJob> {
        self.config.decrypt_function = Some(function);
        self.config.decrypt_assist = true;
        self.reapply_decryption()
    }

    pub fn reapply_decryption(&self) -> Vec<DecryptJob> {
        let Some(function) = self.config.active_decrypt_function() else {
            return Vec::new();
        };
        self.store
            .iter()
            .flat_map(|record| jobs_for(record, function, &self.config.ciphertext_field))
            .collect()
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.store.set_paused(paused);
    }

    pub fn select(&mut self, id: Option<RecordId>) -> bool {
        let accepted = self.store.select(id);
        if let (true, Some(id)) = (accepted, id) {
            self.notify(StoreEvent::Rerender(id));
        }
        accepted
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.index.clear();
        self.notify(StoreEvent::Cleared);
    }
}

enum Command {
    SetPaused(bool),
    Clear,
    Select(Option<RecordId>, oneshot::Sender<bool>),
    SetDecryptFunction(Option<String>),
    SetDecryptAssist(bool),
    EnableDecryption(String),
    Record(RecordId, oneshot::Sender<Option<ProtocolRecord>>),
    Nth(usize, oneshot::Sender<Option<ProtocolRecord>>),
    Selected(oneshot::Sender<Option<ProtocolRecord>>),
    Export(oneshot::Sender<Vec<ProtocolRecord>>),
    ExportJson(oneshot::Sender<serde_json::Result<String>>),
}

/// Entry point for starting the correlation actor.
pub struct Correlator;

impl Correlator {
    /// Spawn the actor. The capture agent is installed once immediately; protocol records are
    /// read from `records` until that channel closes.
    pub fn spawn(
        evaluator: Arc<dyn PageEvaluator>,
        config: CaptureConfig,
        records: mpsc::Receiver<ProtocolRecord>,
    ) -> CorrelatorHandle {
        let (events, _) = broadcast::channel(256);
        let (commands, command_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = Actor {
            session: Session::new(config, events.clone()),
            evaluator,
            records,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        CorrelatorHandle {
            commands,
            events,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

struct Actor {
    session: Session,
    evaluator: Arc<dyn PageEvaluator>,
    records: mpsc::Receiver<ProtocolRecord>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        let installer = Arc::clone(&self.evaluator);
        tokio::spawn(async move {
            bridge::install(installer.as_ref()).await;
        });

        let (invoker, mut decrypt_rx) = DecryptInvoker::new(Arc::clone(&self.evaluator));
        let (drain_tx, mut drain_rx) = mpsc::unbounded_channel::<Vec<PlainEvent>>();
        let mut draining = false;
        let mut records_open = true;

        let period = Duration::from_millis(self.session.config().poll_interval_ms.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(target: "correlator", poll_ms = period.as_millis() as u64, "correlator started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !draining {
                        draining = true;
                        let evaluator = Arc::clone(&self.evaluator);
                        let tx = drain_tx.clone();
                        tokio::spawn(async move {
                            let events = bridge::drain(evaluator.as_ref()).await;
                            let _ = tx.send(events);
                        });
                    }
                }
                Some(events) = drain_rx.recv() => {
                    draining = false;
                    self.session.on_drained(events);
                }
                record = self.records.recv(), if records_open => match record {
                    Some(record) => {
                        for job in self.session.on_record(record) {
                            invoker.dispatch(job);
                        }
                    }
                    None => {
                        records_open = false;
                        debug!(target: "correlator", "protocol record source closed");
                    }
                },
                Some(outcome) = decrypt_rx.recv() => {
                    self.session.on_decrypted(outcome);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command, &invoker),
                    None => break,
                },
            }
        }
        info!(target: "correlator", records = self.session.store().len(), "correlator stopped");
    }

    fn handle(&mut self, command: Command, invoker: &DecryptInvoker) {
        match command {
            Command::SetPaused(paused) => self.session.set_paused(paused),
            Command::Clear => self.session.clear(),
            Command::Select(id, reply) => {
                let _ = reply.send(self.session.select(id));
            }
            Command::SetDecryptFunction(function) => {
                for job in self.session.set_decrypt_function(function) {
                    invoker.dispatch(job);
                }
            }
            Command::SetDecryptAssist(enabled) => {
                for job in self.session.set_decrypt_assist(enabled) {
                    invoker.dispatch(job);
                }
            }
            Command::EnableDecryption(function) => {
                for job in self.session.enable_decryption(function) {
                    invoker.dispatch(job);
                }
            }
            Command::Record(id, reply) => {
                let _ = reply.send(self.session.store().get(id).cloned());
            }
            Command::Nth(position, reply) => {
                let _ = reply.send(self.session.store().nth(position).cloned());
            }
            Command::Selected(reply) => {
                let store = self.session.store();
                let _ = reply.send(store.selected().and_then(|id| store.get(id).cloned()));
            }
            Command::Export(reply) => {
                let _ = reply.send(self.session.store().export());
            }
            Command::ExportJson(reply) => {
                let _ = reply.send(self.session.store().export_json());
            }
        }
    }
}

/// Control surface of a running correlator, shared by the console and the shutdown path.
pub struct CorrelatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<StoreEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CorrelatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), CorrelatorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CorrelatorError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| CorrelatorError::ChannelClosed)
    }

    pub async fn pause(&self) -> Result<(), CorrelatorError> {
        self.send(Command::SetPaused(true)).await
    }

    pub async fn resume(&self) -> Result<(), CorrelatorError> {
        self.send(Command::SetPaused(false)).await
    }

    pub async fn clear_all(&self) -> Result<(), CorrelatorError> {
        self.send(Command::Clear).await
    }

    pub async fn select(&self, id: Option<RecordId>) -> Result<bool, CorrelatorError> {
        self.request(|tx| Command::Select(id, tx)).await
    }

    pub async fn set_decrypt_function(
        &self,
        function: Option<String>,
    ) -> Result<(), CorrelatorError> {
        self.send(Command::SetDecryptFunction(function)).await
    }

    pub async fn set_decrypt_assist(&self, enabled: bool) -> Result<(), CorrelatorError> {
        self.send(Command::SetDecryptAssist(enabled)).await
    }

    pub async fn enable_decryption(&self, function: String) -> Result<(), CorrelatorError> {
        self.send(Command::EnableDecryption(function)).await
    }

    pub async fn record(&self, id: RecordId) -> Result<Option<ProtocolRecord>, CorrelatorError> {
        self.request(|tx| Command::Record(id, tx)).await
    }

    /// Record at a 1-based display position.
    pub async fn nth(&self, position: usize) -> Result<Option<ProtocolRecord>, CorrelatorError> {
        self.request(|tx| Command::Nth(position, tx)).await
    }

    pub async fn selected(&self) -> Result<Option<ProtocolRecord>, CorrelatorError> {
        self.request(Command::Selected).await
    }

    pub async fn export_all(&self) -> Result<Vec<ProtocolRecord>, CorrelatorError> {
        self.request(Command::Export).await
    }

    pub async fn export_json(&self) -> Result<String, CorrelatorError> {
        self.request(Command::ExportJson)
            .await?
            .map_err(CorrelatorError::Export)
    }

    /// Stop the actor and wait for it to finish.
    pub async fn shutdown(&self) -> Result<(), tokio::task::JoinError> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            match task.await {
                Ok(()) => Ok(()),
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for CorrelatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BodySide, CallSite, EventPhase};
    use serde_json::json;

    fn session(config: CaptureConfig) -> (Session, broadcast::Receiver<StoreEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (Session::new(config, tx), rx)
    }

    fn request_event(url: &str, ts: f64, body: serde_json::Value) -> PlainEvent {
        PlainEvent {
            site: CallSite::Client,
            phase: EventPhase::Request,
            method: "POST".into(),
            url: url.into(),
            path: None,
            body: Some(body),
            ts,
            status: None,
        }
    }

    #[test]
    fn record_before_event_attaches_on_next_drain() {
        let (mut session, mut rx) = session(CaptureConfig::default());
        let mut record = ProtocolRecord::new("POST", "http://localhost/api/echo");
        record.started_at = Some(100.0);
        record.request.body = Some(json!("a1b2c3"));
        let id = record.id;

        assert!(session.on_record(record).is_empty());
        assert_eq!(rx.try_recv().ok(), Some(StoreEvent::RecordAdded(id)));
        assert_eq!(rx.try_recv().ok(), Some(StoreEvent::Rerender(id)));

        session.on_drained(vec![request_event(
            "http://localhost/api/echo",
            98.0,
            json!({"hello": "world"}),
        )]);
        assert_eq!(rx.try_recv().ok(), Some(StoreEvent::RecordUpdated(id)));
        assert_eq!(rx.try_recv().ok(), Some(StoreEvent::Rerender(id)));
        assert_eq!(
            session.store().get(id).unwrap().request.plain_body,
            Some(json!({"hello": "world"}))
        );
    }

    #[test]
    fn rescan_is_bounded_to_recent_window() {
        let config = CaptureConfig {
            rescan_window: 1,
            ..CaptureConfig::default()
        };
        let (mut session, _rx) = session(config);
        let old = ProtocolRecord::new("POST", "http://localhost/api/old");
        let old_id = old.id;
        session.on_record(old);
        session.on_record(ProtocolRecord::new("GET", "http://localhost/api/new"));

        session.on_drained(vec![request_event(
            "http://localhost/api/old",
            0.0,
            json!("late"),
        )]);
        assert!(session.store().get(old_id).unwrap().request.plain_body.is_none());
    }

    #[test]
    fn decrypt_jobs_follow_configuration() {
        let (mut session, _rx) = session(CaptureConfig::default());
        let mut record = ProtocolRecord::new("POST", "http://localhost/api/echo");
        record.response.body = Some(json!({"data": "XYZ"}));
        assert!(session.on_record(record).is_empty());

        assert!(session.set_decrypt_assist(true).is_empty());
        let jobs = session.set_decrypt_function(Some("myDecrypt".into()));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].side, BodySide::Response);
        assert_eq!(jobs[0].candidate, json!("XYZ"));
    }

    #[test]
    fn enabling_decryption_never_uses_the_previous_function() {
        let config = CaptureConfig {
            decrypt_function: Some("oldDecrypt".into()),
            ..CaptureConfig::default()
        };
        let (mut session, _rx) = session(config);
        let mut record = ProtocolRecord::new("POST", "http://localhost/api/echo");
        record.request.body = Some(json!("a1b2c3"));
        record.response.body = Some(json!({"data": "XYZ"}));
        session.on_record(record);

        let jobs = session.enable_decryption("myDecrypt".into());
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.function == "myDecrypt"));
        assert_eq!(session.config().active_decrypt_function(), Some("myDecrypt"));
    }

    #[test]
    fn decrypted_value_is_attached_once() {
        let (mut session, _rx) = session(CaptureConfig::default());
        let record = ProtocolRecord::new("POST", "http://localhost/api/echo");
        let id = record.id;
        session.on_record(record);

        for value in [Some(json!({"ok": true})), None, Some(json!({"ok": false}))] {
            session.on_decrypted(DecryptOutcome {
                record: id,
                side: BodySide::Response,
                value,
            });
        }
        assert_eq!(
            session.store().get(id).unwrap().response.decrypted_body,
            Some(json!({"ok": true}))
        );
    }

    #[test]
    fn clear_resets_records_and_buckets() {
        let (mut session, mut rx) = session(CaptureConfig::default());
        session.on_drained(vec![request_event("http://localhost/a", 0.0, json!(1))]);
        session.on_record(ProtocolRecord::new("GET", "http://localhost/b"));
        session.clear();
        assert!(session.store().is_empty());
        assert_eq!(session.index().bucket_count(), 0);
        let mut saw_cleared = false;
        while let Ok(event) = rx.try_recv() {
            saw_cleared |= event == StoreEvent::Cleared;
        }
        assert!(saw_cleared);
    }
}
