//! Client configuration shapes. Parsing the on-disk INI file
//! this hydrates from is an external collaborator's job; this crate only
//! defines the shape and its defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_connect_timeout_secs() -> u64 {
	10
}

fn default_network_timeout_secs() -> u64 {
	30
}

/// `[client]` section of the INI config ("Client config (INI)").
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
	pub base_path: PathBuf,

	#[serde(default = "default_connect_timeout_secs")]
	pub connect_timeout_secs: u64,

	#[serde(default = "default_network_timeout_secs")]
	pub network_timeout_secs: u64,

	#[serde(default)]
	pub idempotency_enabled: bool,
}

impl ClientConfig {
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}

	pub fn network_timeout(&self) -> Duration {
		Duration::from_secs(self.network_timeout_secs)
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			base_path: PathBuf::new(),
			connect_timeout_secs: default_connect_timeout_secs(),
			network_timeout_secs: default_network_timeout_secs(),
			idempotency_enabled: true,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
		assert_eq!(cfg.network_timeout(), Duration::from_secs(30));
		assert!(cfg.idempotency_enabled);
	}

	#[test]
	fn deserializes_with_defaults_when_timeouts_omitted() {
		let toml_like = r#"{"base_path": "/data"}"#;
		let cfg: ClientConfig = serde_json::from_str(toml_like).unwrap();
		assert_eq!(cfg.base_path, PathBuf::from("/data"));
		assert_eq!(cfg.connect_timeout_secs, 10);
	}
}
