#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use campus_domain::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.campus/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".campus").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret the login flow signs bearer tokens with. Required.
	pub auth_hmac_secret: Option<SecretString>,
	/// Send rate limiting: per-connection burst size.
	pub send_rate_limit_per_conn_burst: u32,
	/// Send rate limiting: per-connection sends per minute.
	pub send_rate_limit_per_conn_per_minute: u32,
	/// Send rate limiting: per-room burst size.
	pub send_rate_limit_per_room_burst: u32,
	/// Send rate limiting: per-room sends per minute.
	pub send_rate_limit_per_room_per_minute: u32,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQL store; disabled runs on the in-memory store (dev only).
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	send_rate_limit_per_conn_burst: Option<u32>,
	send_rate_limit_per_conn_per_minute: Option<u32>,
	send_rate_limit_per_room_burst: Option<u32>,
	send_rate_limit_per_room_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				send_rate_limit_per_conn_burst: file.server.send_rate_limit_per_conn_burst.unwrap_or(20),
				send_rate_limit_per_conn_per_minute: file.server.send_rate_limit_per_conn_per_minute.unwrap_or(120),
				send_rate_limit_per_room_burst: file.server.send_rate_limit_per_room_burst.unwrap_or(10),
				send_rate_limit_per_room_per_minute: file.server.send_rate_limit_per_room_per_minute.unwrap_or(60),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("CAMPUS_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server config: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("server config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CAMPUS_SERVER_PERSISTENCE")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "server config: persistence overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_file_applies_defaults_and_filters_empty() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "s3cret"
			metrics_bind = ""

			[persistence]
			enabled = true
			database_url = "sqlite:campus.db"
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_some());
		assert!(cfg.server.metrics_bind.is_none());
		assert_eq!(cfg.server.send_rate_limit_per_conn_burst, 20);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite:campus.db"));
	}

	#[test]
	fn missing_file_yields_defaults() {
		let cfg = load_server_config_from_path(Path::new("/nonexistent/campus/config.toml")).expect("load");
		assert!(!cfg.persistence.enabled);
		assert_eq!(cfg.server.send_rate_limit_per_room_per_minute, 60);
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool("1"), Some(true));
		assert_eq!(parse_env_bool("Off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
