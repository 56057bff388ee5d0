//! Runtime configuration.
//!
//! Resolves `PORT`, `PRIVATE_KEY`, and `APPLICATION_INSIGHTS_CONNECTION_STRING`
//! from the environment, with `MESHCTL_ENV`-aware config directory
//! resolution.

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8080;

/// Telemetry sink connection string, parsed but never exported — wiring an
/// actual exporter is out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConnectionString {
    raw: String,
}

impl TelemetryConnectionString {
    /// Parse a raw `APPLICATION_INSIGHTS_CONNECTION_STRING` value.
    ///
    /// Validates only that it is non-empty and contains at least one
    /// `key=value` segment — full schema validation belongs to the
    /// (out-of-scope) telemetry exporter itself.
    pub fn parse(raw: &str) -> Result<Self> {
        anyhow::ensure!(!raw.trim().is_empty(), "telemetry connection string is empty");
        anyhow::ensure!(raw.contains('='), "telemetry connection string has no key=value segments");
        Ok(Self { raw: raw.to_string() })
    }

    /// The original connection string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Runtime configuration resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signalling server port the CLI connects outbound to as a client.
    pub port: u16,
    /// Telemetry sink connection string, if configured.
    pub telemetry: Option<TelemetryConnectionString>,
}

impl Config {
    /// Resolve configuration from the environment, falling back to defaults.
    ///
    /// `PRIVATE_KEY` is handled separately via [`Config::signing_key`] since
    /// it produces key material rather than a plain config field.
    pub fn load() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse().with_context(|| format!("PORT is not a valid port number: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let telemetry = match std::env::var("APPLICATION_INSIGHTS_CONNECTION_STRING") {
            Ok(raw) if !raw.is_empty() => Some(TelemetryConnectionString::parse(&raw)?),
            _ => None,
        };

        Ok(Self { port, telemetry })
    }

    /// Resolve the node's signing key from `PRIVATE_KEY`, if set.
    ///
    /// Accepts a 32-byte Ed25519 seed, base64 or hex encoded. Returns `None`
    /// if `PRIVATE_KEY` is unset, so the caller can fall back to
    /// [`crate::account_manager::AccountManager::load_or_create`].
    pub fn signing_key_from_env() -> Result<Option<SigningKey>> {
        let Ok(raw) = std::env::var("PRIVATE_KEY") else {
            return Ok(None);
        };
        let bytes = decode_seed(&raw).context("PRIVATE_KEY is not valid base64 or hex")?;
        let seed: [u8; 32] =
            bytes.try_into().map_err(|v: Vec<u8>| anyhow::anyhow!("PRIVATE_KEY must decode to 32 bytes, got {}", v.len()))?;
        Ok(Some(SigningKey::from_bytes(&seed)))
    }

    /// The configuration directory, created if necessary.
    ///
    /// Directory selection priority:
    /// 1. `MESHCTL_CONFIG_DIR` env var: explicit override.
    /// 2. `crate::env::should_skip_keyring()` (test/system-test modes):
    ///    `tmp/meshctl-test` under the crate root.
    /// 3. Production: the platform config directory (e.g. `~/.config/meshctl`
    ///    on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(explicit) = std::env::var("MESHCTL_CONFIG_DIR") {
            PathBuf::from(explicit)
        } else if crate::env::should_skip_keyring() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/meshctl-test")
        } else {
            dirs::config_dir().context("could not determine platform config directory")?.join("meshctl")
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn decode_seed(raw: &str) -> Result<Vec<u8>> {
    use base64::Engine as _;
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw.trim()) {
        return Ok(bytes);
    }
    hex_decode(raw.trim()).context("neither valid base64 nor valid hex")
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    anyhow::ensure!(raw.len() % 2 == 0, "odd-length hex string");
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|e| anyhow::anyhow!("invalid hex digit: {e}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_rejects_empty() {
        assert!(TelemetryConnectionString::parse("").is_err());
    }

    #[test]
    fn test_telemetry_accepts_key_value() {
        let parsed = TelemetryConnectionString::parse("InstrumentationKey=abc-123").unwrap();
        assert_eq!(parsed.as_str(), "InstrumentationKey=abc-123");
    }

    #[test]
    fn test_hex_decode_roundtrip() {
        let decoded = hex_decode("0011ff").unwrap();
        assert_eq!(decoded, vec![0x00, 0x11, 0xff]);
    }

    #[test]
    fn test_hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }

    #[test]
    fn test_signing_key_from_env_absent_returns_none() {
        std::env::remove_var("PRIVATE_KEY");
        assert!(Config::signing_key_from_env().unwrap().is_none());
    }

    #[test]
    fn test_config_dir_is_created() {
        let dir = Config::config_dir().unwrap();
        assert!(dir.exists());
    }
}
