//! Configuration types for the correlation engine.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Fetch request/response bodies from the protocol layer.
    pub capture_bodies: bool,
    /// Invoke the page-side decryption function for ciphertext-looking bodies.
    pub decrypt_assist: bool,
    /// Name of a `window`-scoped function taking one serialized argument.
    pub decrypt_function: Option<String>,
    pub poll_interval_ms: u64,
    /// How many of the most recent records are re-attached on every poll tick.
    pub rescan_window: usize,
    pub bucket_high_water: usize,
    pub bucket_retain: usize,
    /// Field of a structured response body that carries ciphertext.
    pub ciphertext_field: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_bodies: true,
            decrypt_assist: false,
            decrypt_function: None,
            poll_interval_ms: 500,
            rescan_window: 50,
            bucket_high_water: 1000,
            bucket_retain: 200,
            ciphertext_field: "data".to_string(),
        }
    }
}

impl CaptureConfig {
    /// The configured function name when decryption assist is active.
    pub fn active_decrypt_function(&self) -> Option<&str> {
        if !self.decrypt_assist {
            return None;
        }
        self.decrypt_function
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_like_json_keeps_defaults() {
        let cfg: CaptureConfig =
            serde_json::from_str(r#"{ "decrypt_assist": true, "decrypt_function": "myDecrypt" }"#)
                .expect("parse config");
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.bucket_high_water, 1000);
        assert_eq!(cfg.active_decrypt_function(), Some("myDecrypt"));
    }

    #[test]
    fn blank_function_name_disables_assist() {
        let cfg = CaptureConfig {
            decrypt_assist: true,
            decrypt_function: Some("   ".into()),
            ..CaptureConfig::default()
        };
        assert_eq!(cfg.active_decrypt_function(), None);
    }
}
