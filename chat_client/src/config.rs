use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use url::Url;

use crate::backoff::ReconnectPolicy;

/// Command line options for the probe binary.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Base HTTP URL of the chat server.
    #[arg(long)]
    pub base_url: Option<String>,
    /// Conversation to open on start.
    #[arg(long)]
    pub conversation: Option<i64>,
    /// Acting user id.
    #[arg(long)]
    pub user: Option<i64>,
    /// Bearer token forwarded on REST and socket requests.
    #[arg(long)]
    pub token: Option<String>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Tunables of the messaging layer. Constructed directly by library users;
/// the probe binary resolves one from file, env and CLI via
/// [`ProbeConfig::load`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Base HTTP(S) URL of the server; socket URLs are derived from it.
    pub base_url: Url,
    /// Id of the authenticated user, used to filter own typing state and
    /// to match send echoes.
    pub user_id: i64,
    /// Bearer token attached to REST and socket requests when present.
    pub auth_token: Option<String>,
    /// Base delay of the reconnect schedule.
    pub reconnect_base: Duration,
    /// Reconnect attempts before a channel is marked failed.
    pub reconnect_attempts: u32,
    /// How long a typing indicator survives without a stop event.
    pub typing_timeout: Duration,
    /// Suppression window for repeated outbound typing starts.
    pub typing_debounce: Duration,
    /// Window for matching a socket echo against a pending optimistic send.
    pub echo_window: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url.as_str())
            .field("user_id", &self.user_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("typing_timeout", &self.typing_timeout)
            .field("typing_debounce", &self.typing_debounce)
            .field("echo_window", &self.echo_window)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(base_url: Url, user_id: i64) -> Self {
        Self {
            base_url,
            user_id,
            auth_token: None,
            reconnect_base: ReconnectPolicy::DEFAULT_BASE,
            reconnect_attempts: ReconnectPolicy::DEFAULT_MAX_ATTEMPTS,
            typing_timeout: Duration::from_secs(default_typing_timeout_secs()),
            typing_debounce: Duration::from_secs(default_typing_debounce_secs()),
            echo_window: Duration::from_secs(10),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_base, self.reconnect_attempts)
    }

    /// Socket URL for one conversation's chat channel.
    pub fn chat_socket_url(&self, conversation_id: i64) -> Result<Url> {
        self.socket_url(&format!("/ws/chat/{}/", conversation_id))
    }

    /// Socket URL for the global notification channel.
    pub fn notification_socket_url(&self) -> Result<Url> {
        self.socket_url("/ws/notifications/")
    }

    fn socket_url(&self, path: &str) -> Result<Url> {
        let scheme = match self.base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => anyhow::bail!("unsupported_scheme: {other}"),
        };
        let mut url = self.base_url.clone();
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("unsupported_scheme"))?;
        url.set_path(path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

/// Probe configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub client: ClientConfig,
    pub conversation: Option<i64>,
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    session: FileSession,
    #[serde(default)]
    reconnect: FileReconnect,
    #[serde(default)]
    typing: FileTyping,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_base_url")]
    base_url: String,
}

#[derive(Deserialize, Default)]
struct FileSession {
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct FileReconnect {
    #[serde(default = "default_reconnect_base_secs")]
    base_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    attempts: u32,
}

#[derive(Deserialize)]
struct FileTyping {
    #[serde(default = "default_typing_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_typing_debounce_secs")]
    debounce_secs: u64,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8787".into()
}

fn default_reconnect_base_secs() -> u64 {
    3
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_typing_timeout_secs() -> u64 {
    6
}

fn default_typing_debounce_secs() -> u64 {
    2
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Default for FileReconnect {
    fn default() -> Self {
        Self {
            base_secs: default_reconnect_base_secs(),
            attempts: default_reconnect_attempts(),
        }
    }
}

impl Default for FileTyping {
    fn default() -> Self {
        Self {
            timeout_secs: default_typing_timeout_secs(),
            debounce_secs: default_typing_debounce_secs(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl ProbeConfig {
    /// Resolve configuration from CLI, environment variables, config file
    /// and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut base_url = default_base_url();
        let mut user_id: Option<i64> = None;
        let mut token: Option<String> = None;
        let mut reconnect_base_secs = default_reconnect_base_secs();
        let mut reconnect_attempts = default_reconnect_attempts();
        let mut typing_timeout_secs = default_typing_timeout_secs();
        let mut typing_debounce_secs = default_typing_debounce_secs();
        let mut logging = default_logging();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_CLIENT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_client.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            base_url = file_cfg.server.base_url;
            user_id = file_cfg.session.user_id;
            token = file_cfg.session.token;
            reconnect_base_secs = file_cfg.reconnect.base_secs;
            reconnect_attempts = file_cfg.reconnect.attempts;
            typing_timeout_secs = file_cfg.typing.timeout_secs;
            typing_debounce_secs = file_cfg.typing.debounce_secs;
            logging = file_cfg.logging.enabled;
        }

        // environment overrides
        if let Ok(v) = std::env::var("CHAT_CLIENT_BASE_URL") {
            base_url = v;
        }
        if let Ok(v) = std::env::var("CHAT_CLIENT_USER_ID") {
            if let Ok(v) = v.parse::<i64>() {
                user_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("CHAT_CLIENT_TOKEN") {
            token = Some(v);
        }
        if let Ok(v) = std::env::var("CHAT_CLIENT_LOGGING") {
            if let Ok(v) = v.parse::<bool>() {
                logging = v;
            }
        }

        // CLI overrides
        if let Some(v) = &cli.base_url {
            base_url = v.clone();
        }
        if let Some(v) = cli.user {
            user_id = Some(v);
        }
        if let Some(v) = &cli.token {
            token = Some(v.clone());
        }
        if let Some(v) = cli.logging {
            logging = v;
        }

        let base_url = Url::parse(&base_url).context("invalid base url")?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("unsupported_scheme");
        }
        if reconnect_attempts == 0 {
            anyhow::bail!("invalid_reconnect_attempts");
        }
        // typing indicators should outlive a lost stop frame only briefly
        if !(5..=8).contains(&typing_timeout_secs) {
            anyhow::bail!("typing_timeout_out_of_range");
        }
        let user_id = match user_id {
            Some(id) => id,
            None => anyhow::bail!("missing_user_id"),
        };

        let mut client = ClientConfig::new(base_url, user_id);
        client.auth_token = token;
        client.reconnect_base = Duration::from_secs(reconnect_base_secs);
        client.reconnect_attempts = reconnect_attempts;
        client.typing_timeout = Duration::from_secs(typing_timeout_secs);
        client.typing_debounce = Duration::from_secs(typing_debounce_secs);

        Ok(Self {
            client,
            conversation: cli.conversation,
            logging_enabled: logging,
        })
    }
}
