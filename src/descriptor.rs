//! Connection parameters for reaching a queue manager.

use std::fmt;
use std::path::PathBuf;

/// Cipher spec requested whenever a TLS keystore is configured.
pub const TLS_CIPHER_SPEC: &str = "ANY_TLS12_OR_HIGHER";

/// User id and password sent when authenticating.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS settings derived from the keystore path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub key_repository: PathBuf,
    pub cipher_spec: String,
}

/// Immutable description of how to (re)establish a connection.
///
/// Built once when the client starts and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub queue_manager: String,
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsSettings>,
    pub application_name: String,
}

impl ConnectionDescriptor {
    pub fn new(
        queue_manager: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            queue_manager: queue_manager.into(),
            host: host.into(),
            port,
            channel: channel.into(),
            credentials: None,
            tls: None,
            application_name: crate::defaults::APPLICATION_NAME.to_string(),
        }
    }

    /// Attach credentials. An empty user id means "connect without
    /// credentials", so it leaves the descriptor untouched.
    pub fn with_credentials(mut self, user_id: &str, password: &str) -> Self {
        if !user_id.is_empty() {
            self.credentials = Some(Credentials {
                user_id: user_id.to_string(),
                password: password.to_string(),
            });
        }
        self
    }

    /// Enable TLS using the given key repository. `None` or an empty path
    /// keeps the connection in plain text.
    pub fn with_tls_keystore(mut self, keystore: Option<PathBuf>) -> Self {
        self.tls = keystore
            .filter(|path| !path.as_os_str().is_empty())
            .map(|key_repository| TlsSettings {
                key_repository,
                cipher_spec: TLS_CIPHER_SPEC.to_string(),
            });
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Connection name in `host(port)` form.
    pub fn connection_name(&self) -> String {
        format!("{}({})", self.host, self.port)
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} on {}{}",
            self.queue_manager,
            self.channel,
            self.connection_name(),
            if self.uses_tls() { " (TLS)" } else { "" }
        )
    }
}
