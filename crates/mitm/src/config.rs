//! Configuration layer: a `RawConfig` deserialized straight from YAML, with every field
//! optional, resolved into a fully-populated `Config`. Mirrors the teacher's own
//! `RawConfig`/`Config` split and `original_source/main.go`'s `LoadConfig`: open-or-create the
//! file, and if it was empty, populate it with defaults (including a random 8-char password) and
//! persist those defaults back to disk before continuing.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9080;
const DEFAULT_LARGE: usize = 1024 * 1024 * 5;
const DEFAULT_NAME: &str = "mitm";
const DEFAULT_ORIGIN: &[&str] = &["http://127.0.0.1", "https://127.0.0.1"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
	pub addr: Option<String>,
	pub port: Option<u16>,
	pub large: Option<usize>,
	pub name: Option<String>,
	pub pass: Option<String>,
	#[serde(default)]
	pub origin: Vec<String>,
	pub mode: Option<String>,
}

impl RawConfig {
	fn with_generated_defaults() -> RawConfig {
		RawConfig {
			addr: Some(DEFAULT_ADDR.to_string()),
			port: Some(DEFAULT_PORT),
			large: Some(DEFAULT_LARGE),
			name: Some(DEFAULT_NAME.to_string()),
			pass: Some(random_password()),
			origin: DEFAULT_ORIGIN.iter().map(|s| s.to_string()).collect(),
			mode: None,
		}
	}

	fn resolve(self) -> Config {
		Config {
			addr: self.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
			port: self.port.unwrap_or(DEFAULT_PORT),
			large: self.large.unwrap_or(DEFAULT_LARGE),
			name: self.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
			pass: self.pass.unwrap_or_else(random_password),
			origin: if self.origin.is_empty() {
				DEFAULT_ORIGIN.iter().map(|s| s.to_string()).collect()
			} else {
				self.origin
			},
			mode: self.mode.unwrap_or_default(),
		}
	}
}

fn random_password() -> String {
	let id = uuid::Uuid::new_v4().simple().to_string();
	id[..8].to_string()
}

/// Fully-resolved configuration the rest of the program consumes.
#[derive(Debug, Clone)]
pub struct Config {
	pub addr: String,
	pub port: u16,
	pub large: usize,
	pub name: String,
	pub pass: String,
	pub origin: Vec<String>,
	pub mode: String,
}

impl Config {
	/// `addr:port` — where the proxy-side collaborator listens.
	pub fn proxy_listen(&self) -> String {
		format!("{}:{}", self.addr, self.port)
	}

	/// `addr:(port+1)` — where the control-plane HTTP/WS listener binds.
	pub fn web_listen(&self) -> String {
		format!("{}:{}", self.addr, self.port + 1)
	}

	pub fn cert_dir(&self) -> &'static str {
		"cert.d"
	}

	pub fn allows_origin(&self, origin: &str) -> bool {
		!origin.is_empty() && self.origin.iter().any(|o| o == origin)
	}
}

/// Opens `path` for read/write, creating it if absent. If the file is empty (freshly created),
/// writes out generated defaults and returns those; otherwise parses the existing YAML.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
	let path = path.as_ref();
	let mut file = fs_err::OpenOptions::new()
		.create(true)
		.read(true)
		.write(true)
		.open(path)?;

	let mut contents = String::new();
	file.read_to_string(&mut contents)?;

	if contents.trim().is_empty() {
		let raw = RawConfig::with_generated_defaults();
		let yaml = serde_yaml::to_string(&raw)?;
		file.seek(SeekFrom::Start(0))?;
		file.write_all(yaml.as_bytes())?;
		return Ok(raw.resolve());
	}

	let raw: RawConfig = serde_yaml::from_str(&contents)?;
	let cfg = raw.resolve();
	anyhow::ensure!(!cfg.name.is_empty(), "config name must not be empty");
	anyhow::ensure!(!cfg.pass.is_empty(), "config pass must not be empty");
	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn creates_defaults_on_first_run() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mitm.yaml");
		let cfg = load_config(&path).unwrap();
		assert_eq!(cfg.addr, DEFAULT_ADDR);
		assert_eq!(cfg.port, DEFAULT_PORT);
		assert_eq!(cfg.pass.len(), 8);
		assert!(path.exists());
	}

	#[test]
	fn reloads_persisted_defaults_identically() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mitm.yaml");
		let first = load_config(&path).unwrap();
		let second = load_config(&path).unwrap();
		assert_eq!(first.pass, second.pass);
		assert_eq!(first.name, second.name);
	}

	#[test]
	fn parses_existing_config() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mitm.yaml");
		std::fs::write(
			&path,
			"addr: 127.0.0.1\nport: 9999\nname: test\npass: secret123\norigin: []\n",
		)
		.unwrap();
		let cfg = load_config(&path).unwrap();
		assert_eq!(cfg.addr, "127.0.0.1");
		assert_eq!(cfg.port, 9999);
		assert_eq!(cfg.name, "test");
		assert_eq!(cfg.pass, "secret123");
	}

	#[test]
	fn listen_addresses_derive_from_port() {
		let cfg = RawConfig {
			addr: Some("0.0.0.0".into()),
			port: Some(9080),
			..Default::default()
		}
		.resolve();
		assert_eq!(cfg.proxy_listen(), "0.0.0.0:9080");
		assert_eq!(cfg.web_listen(), "0.0.0.0:9081");
	}
}
