//! Server configuration.
//!
//! Populated from environment variables and/or CLI flags at startup; no
//! dynamic reload. Changes take effect on restart.

use std::path::PathBuf;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Root directory holding per-user data.
    pub data_root: PathBuf,
    /// Session database path. Defaults to `<data_root>/session.db`.
    pub session_db: Option<PathBuf>,
    /// Credential database path. When unset, any password is accepted.
    pub auth_db: Option<PathBuf>,
    /// Maximum accepted collection upload, in bytes.
    pub max_upload_bytes: usize,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl ServerConfig {
    /// Creates a configuration with the given data root.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 27701,
            data_root: data_root.into(),
            session_db: None,
            auth_db: None,
            max_upload_bytes: 256 * 1024 * 1024,
            log_filter: "info".into(),
        }
    }

    /// Sets the bind address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the session database path.
    pub fn with_session_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_db = Some(path.into());
        self
    }

    /// Enables the SQLite identity gateway backed by `path`.
    pub fn with_auth_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_db = Some(path.into());
        self
    }

    /// Sets the collection upload cap.
    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Overlays values from `RECALL_*` environment variables.
    pub fn overlay_env(mut self) -> Self {
        if let Ok(host) = std::env::var("RECALL_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("RECALL_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(root) = std::env::var("RECALL_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Ok(path) = std::env::var("RECALL_SESSION_DB") {
            self.session_db = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RECALL_AUTH_DB") {
            self.auth_db = Some(PathBuf::from(path));
        }
        if let Ok(mb) = std::env::var("RECALL_MAX_UPLOAD_MB") {
            if let Ok(mb) = mb.parse::<usize>() {
                self.max_upload_bytes = mb * 1024 * 1024;
            }
        }
        self
    }

    /// Effective session database path.
    pub fn session_db_path(&self) -> PathBuf {
        self.session_db
            .clone()
            .unwrap_or_else(|| self.data_root.join("session.db"))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 27701);
        assert!(config.auth_db.is_none());
        assert_eq!(
            config.session_db_path(),
            PathBuf::from("./data").join("session.db")
        );
    }

    #[test]
    fn builder() {
        let config = ServerConfig::new("/srv/recall")
            .with_host("0.0.0.0")
            .with_port(9000)
            .with_auth_db("/srv/recall/auth.db")
            .with_max_upload_bytes(1024);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_upload_bytes, 1024);
        assert!(config.auth_db.is_some());
    }
}
