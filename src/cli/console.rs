//! Line-oriented console standing in for the inspector toolbar.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use cipherscope_correlator::{CorrelatorHandle, RecordId, StoreEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::render;

pub const HELP: &str = "commands: pause | resume | clear | list [filter] | select <n> | show | \
decrypt <fn>|off | bodies on|off | export <file> | help | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    Clear,
    List(Option<String>),
    Select(usize),
    Show,
    /// `None` turns decryption assist off.
    Decrypt(Option<String>),
    /// Toggle body capture for transactions finishing from now on.
    Bodies(bool),
    Export(PathBuf),
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let argument = (!rest.is_empty()).then(|| rest.to_string());

        match verb.to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "clear" => Ok(Self::Clear),
            "list" | "ls" => Ok(Self::List(argument)),
            "select" => rest
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Self::Select)
                .ok_or_else(|| "usage: select <n> (1-based)".to_string()),
            "show" => Ok(Self::Show),
            "decrypt" => match argument {
                Some(name) if name.eq_ignore_ascii_case("off") => Ok(Self::Decrypt(None)),
                Some(name) => Ok(Self::Decrypt(Some(name))),
                None => Err("usage: decrypt <function>|off".to_string()),
            },
            "bodies" => match rest.to_ascii_lowercase().as_str() {
                "on" => Ok(Self::Bodies(true)),
                "off" => Ok(Self::Bodies(false)),
                _ => Err("usage: bodies on|off".to_string()),
            },
            "export" => argument
                .map(|path| Self::Export(PathBuf::from(path)))
                .ok_or_else(|| "usage: export <file>".to_string()),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            "" => Err(String::new()),
            other => Err(format!("unknown command '{other}'; {HELP}")),
        }
    }
}

pub async fn write_export(handle: &CorrelatorHandle, path: &Path) -> Result<usize> {
    let records = handle.export_all().await?;
    let json = serde_json::to_string_pretty(&records).context("Failed to serialize records")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(records.len())
}

/// Console-side view state. Remembers what was last printed so repeated re-render
/// requests stay quiet, and numbers records in arrival order.
#[derive(Default)]
struct DetailView {
    last: Option<(RecordId, String)>,
    added: usize,
}

impl DetailView {
    fn render(&mut self, id: RecordId, text: String, force: bool) {
        let unchanged = matches!(&self.last, Some((last_id, last)) if *last_id == id && *last == text);
        if force || !unchanged {
            println!("{text}");
        }
        self.last = Some((id, text));
    }

    fn reset(&mut self) {
        self.last = None;
        self.added = 0;
    }
}

async fn execute(
    handle: &CorrelatorHandle,
    bodies: &AtomicBool,
    command: ConsoleCommand,
    view: &mut DetailView,
) -> Result<bool> {
    match command {
        ConsoleCommand::Pause => {
            handle.pause().await?;
            println!("capture paused");
        }
        ConsoleCommand::Resume => {
            handle.resume().await?;
            println!("capture resumed");
        }
        ConsoleCommand::Clear => handle.clear_all().await?,
        ConsoleCommand::List(filter) => {
            let records = handle.export_all().await?;
            for (idx, record) in records.iter().enumerate() {
                if filter
                    .as_deref()
                    .map_or(true, |needle| render::matches_filter(record, needle))
                {
                    println!("{}", render::summary_line(idx + 1, record));
                }
            }
        }
        ConsoleCommand::Select(position) => match handle.nth(position).await? {
            Some(record) => {
                handle.select(Some(record.id)).await?;
            }
            None => println!("no record #{position}"),
        },
        ConsoleCommand::Show => match handle.selected().await? {
            Some(record) => view.render(record.id, render::detail(&record), true),
            None => println!("nothing selected"),
        },
        ConsoleCommand::Decrypt(Some(function)) => {
            handle.enable_decryption(function.clone()).await?;
            println!("decryption assist on, using window.{function}");
        }
        ConsoleCommand::Decrypt(None) => {
            handle.set_decrypt_assist(false).await?;
            println!("decryption assist off");
        }
        ConsoleCommand::Bodies(enabled) => {
            bodies.store(enabled, Ordering::Relaxed);
            println!("body capture {}", if enabled { "on" } else { "off" });
        }
        ConsoleCommand::Export(path) => {
            let count = write_export(handle, &path).await?;
            println!("exported {count} records to {}", path.display());
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn on_store_event(
    handle: &CorrelatorHandle,
    event: StoreEvent,
    view: &mut DetailView,
) -> Result<()> {
    match event {
        StoreEvent::RecordAdded(id) => {
            view.added += 1;
            if let Some(record) = handle.record(id).await? {
                println!("{}", render::summary_line(view.added, &record));
            }
        }
        StoreEvent::Rerender(id) => {
            if let Some(record) = handle.record(id).await? {
                view.render(id, render::detail(&record), false);
            }
        }
        StoreEvent::RecordUpdated(id) => debug!(%id, "record updated"),
        StoreEvent::Cleared => {
            view.reset();
            println!("records cleared");
        }
    }
    Ok(())
}

/// Run until `quit`, Ctrl-C, or the page session ends.
pub async fn run(
    handle: &CorrelatorHandle,
    bodies: &AtomicBool,
    session: &mut JoinHandle<()>,
) -> Result<()> {
    let mut events = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut view = DetailView::default();
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => {
                        if !execute(handle, bodies, command, &mut view).await? {
                            break;
                        }
                    }
                    Err(message) if message.is_empty() => {}
                    Err(message) => println!("{message}"),
                },
                Ok(None) => {
                    debug!("stdin closed; watching until interrupted");
                    stdin_open = false;
                }
                Err(err) => {
                    warn!(?err, "failed to read console input");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(event) => on_store_event(handle, event, &mut view).await?,
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "console lagged behind store events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            _ = &mut *session => {
                warn!("page session ended");
                break;
            }
        }
    }
    Ok(())
}
