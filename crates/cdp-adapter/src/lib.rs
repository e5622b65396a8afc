//! Chromium DevTools Protocol plumbing for cipherscope.
//!
//! Provides the websocket transport (launching Chromium or connecting to an existing
//! DevTools endpoint), page attachment with a `Runtime.evaluate`-backed page evaluator, and a
//! Network-domain assembler that turns `Network.*` events into finished protocol records.

use std::{env, path::PathBuf};

use which::which;

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("cdp command timed out")]
        Timeout,
        #[error("target not found")]
        TargetNotFound,
        #[error("page evaluation failed")]
        Evaluation,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to callers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }
    }

    /// Shorthand for failures decoding CDP payloads.
    pub(crate) fn decode_error(err: serde_json::Error) -> AdapterError {
        AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{
        env,
        path::{Path, PathBuf},
    };

    /// Configuration for launching or connecting to Chromium.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        /// Connect to an already running browser instead of launching one.
        pub websocket_url: Option<String>,
        pub default_deadline_ms: u64,
        pub heartbeat_interval_ms: u64,
        pub launch_timeout_ms: u64,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                websocket_url: None,
                default_deadline_ms: 30_000,
                heartbeat_interval_ms: 15_000,
                launch_timeout_ms: 20_000,
            }
        }
    }

    fn resolve_headless_default() -> bool {
        match env::var("CIPHERSCOPE_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("CIPHERSCOPE_PROFILE") {
            return PathBuf::from(path);
        }

        let default = Path::new("./.cipherscope-profile");
        default.into()
    }
}

pub mod metrics;
pub mod network;
pub mod page;
pub mod transport;
pub mod util;

pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use network::{pump_events, NetworkAssembler};
pub use page::{PageSession, TargetSelector};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("CIPHERSCOPE_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    chrome_executable_names()
        .iter()
        .find_map(|name| which(name).ok())
        .or_else(|| {
            os_specific_chrome_paths()
                .into_iter()
                .find(|candidate| candidate.exists())
        })
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "freebsd")))]
    {
        Vec::new()
    }
}
