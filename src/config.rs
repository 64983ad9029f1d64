use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Merged configuration consumed by the supervisor
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub websocket_upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub proxy: ProxyOptions,
    #[serde(default)]
    pub cors: CorsOptions,
}

/// One proxy endpoint: a listener plus the upstreams it serves
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub websocket_port: Option<u16>,
    #[serde(default)]
    pub kind: ServerKind,
    #[serde(default)]
    pub upstreams: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    // Per-server section overrides; global values apply when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsOptions>,
}

/// Explicit listener variant; the server name is purely cosmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Http,
    Websocket,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_health_check")]
    pub health_check: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub method: LoadBalancerMethod,
    #[serde(default = "default_lb_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            method: LoadBalancerMethod::default(),
            timeout: default_lb_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerMethod {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Single,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Forwarding options; every field is bounds-checked in `Config::validate`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyOptions {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_response_timeout", with = "duration_serde")]
    pub response_timeout: Duration,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_keep_alive_timeout", with = "duration_serde")]
    pub keep_alive_timeout: Duration,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub enable_compression: bool,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default)]
    pub max_conns_per_host: usize,
    #[serde(default = "default_idle_conn_timeout", with = "duration_serde")]
    pub idle_conn_timeout: Duration,
    #[serde(default)]
    pub enable_http2: bool,
    #[serde(default)]
    pub enable_http3: bool,
    #[serde(default)]
    pub enable_websocket: bool,
    #[serde(default = "default_http3_port")]
    pub http3_port: u16,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    #[serde(default = "default_websocket_timeout", with = "duration_serde")]
    pub websocket_timeout: Duration,
    #[serde(default = "default_websocket_buffer_size")]
    pub websocket_buffer_size: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            request_timeout: default_request_timeout(),
            response_timeout: default_response_timeout(),
            max_header_size: default_max_header_size(),
            keep_alive_timeout: default_keep_alive_timeout(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            enable_compression: false,
            max_idle_conns: default_max_idle_conns(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            max_conns_per_host: 0,
            idle_conn_timeout: default_idle_conn_timeout(),
            enable_http2: false,
            enable_http3: false,
            enable_websocket: false,
            http3_port: default_http3_port(),
            tls_cert_file: None,
            tls_key_file: None,
            websocket_timeout: default_websocket_timeout(),
            websocket_buffer_size: default_websocket_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age: u64,
}

/// A single `<name>.toml` server file
#[derive(Debug, Clone, Deserialize)]
struct ServerFileConfig {
    server: ServerConfig,
    #[serde(default)]
    load_balancer: Option<LoadBalancerConfig>,
    #[serde(default)]
    logging: Option<LoggingConfig>,
    #[serde(default)]
    proxy: Option<ProxyOptions>,
    #[serde(default)]
    cors: Option<CorsOptions>,
}

impl Config {
    /// Load a single legacy configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `global.toml` plus one `<name>.toml` per server from a directory.
    /// Server-local sections override the globals; disabled servers are skipped.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let global_path = dir.join("global.toml");
        let content = std::fs::read_to_string(&global_path)
            .with_context(|| format!("failed to read global config: {}", global_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse global config: {}", global_path.display()))?;

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to scan config directory: {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
                    && p.file_name() != Some(std::ffi::OsStr::new("global.toml"))
            })
            .collect();
        entries.sort();

        for path in entries {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => continue,
            };

            let file: ServerFileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse server config: {}", path.display()))?;

            if !file.server.enabled {
                continue;
            }

            let mut server = file.server;
            server.load_balancer = file.load_balancer.or(server.load_balancer);
            server.logging = file.logging.or(server.logging);
            server.proxy = file.proxy.or(server.proxy);
            server.cors = file.cors.or(server.cors);
            config.servers.push(server);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn enabled_servers(&self) -> Vec<&ServerConfig> {
        self.servers.iter().filter(|s| s.enabled).collect()
    }

    pub fn upstreams_by_names(&self, names: &[String]) -> Vec<UpstreamConfig> {
        self.upstreams
            .iter()
            .filter(|u| names.contains(&u.name))
            .cloned()
            .collect()
    }

    pub fn websocket_upstreams_by_names(&self, names: &[String]) -> Vec<UpstreamConfig> {
        self.websocket_upstreams
            .iter()
            .filter(|u| names.contains(&u.name))
            .cloned()
            .collect()
    }

    pub fn load_balancer_for(&self, server: &ServerConfig) -> LoadBalancerConfig {
        server.load_balancer.clone().unwrap_or_else(|| self.load_balancer.clone())
    }

    pub fn logging_for(&self, server: &ServerConfig) -> LoggingConfig {
        server.logging.clone().unwrap_or_else(|| self.logging.clone())
    }

    pub fn proxy_for(&self, server: &ServerConfig) -> ProxyOptions {
        server.proxy.clone().unwrap_or_else(|| self.proxy.clone())
    }

    pub fn cors_for(&self, server: &ServerConfig) -> CorsOptions {
        server.cors.clone().unwrap_or_else(|| self.cors.clone())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for upstream in self.upstreams.iter().chain(self.websocket_upstreams.iter()) {
            let url = Url::parse(&upstream.url)
                .with_context(|| format!("invalid upstream URL for '{}': {}", upstream.name, upstream.url))?;
            match url.scheme() {
                "http" | "https" | "ws" | "wss" => {}
                scheme => bail!(
                    "unsupported scheme '{}' for upstream '{}'",
                    scheme,
                    upstream.name
                ),
            }
        }

        for server in self.enabled_servers() {
            if server.port == 0 {
                bail!("server '{}' has port 0", server.name);
            }

            for name in &server.upstreams {
                let known = self.upstreams.iter().any(|u| &u.name == name)
                    || self.websocket_upstreams.iter().any(|u| &u.name == name);
                if !known {
                    bail!("server '{}' references unknown upstream '{}'", server.name, name);
                }
            }

            let proxy = self.proxy_for(server);
            if proxy.max_body_size == 0 {
                bail!("server '{}': max_body_size cannot be zero", server.name);
            }
            if proxy.max_header_size == 0 {
                bail!("server '{}': max_header_size cannot be zero", server.name);
            }
            if proxy.request_timeout.is_zero() || proxy.response_timeout.is_zero() {
                bail!("server '{}': request and response timeouts cannot be zero", server.name);
            }
            if (proxy.enable_http2 || proxy.enable_http3)
                && (proxy.tls_cert_file.as_deref().unwrap_or("").is_empty()
                    || proxy.tls_key_file.as_deref().unwrap_or("").is_empty())
            {
                bail!(
                    "server '{}': tls_cert_file and tls_key_file are required when HTTP/2 or HTTP/3 is enabled",
                    server.name
                );
            }
            if proxy.enable_http3 && proxy.http3_port == 0 {
                bail!("server '{}': http3_port cannot be zero", server.name);
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The WebSocket listener binds its dedicated port when configured
    pub fn websocket_address(&self) -> String {
        format!("{}:{}", self.host, self.websocket_port.unwrap_or(self.port))
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_health_check() -> String {
    "/health".to_string()
}

fn default_lb_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_header_size() -> usize {
    8 * 1024
}

fn default_keep_alive_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_max_idle_conns_per_host() -> usize {
    10
}

fn default_idle_conn_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_http3_port() -> u16 {
    8443
}

fn default_websocket_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_websocket_buffer_size() -> usize {
    4096
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
            Some(pos) => s.split_at(pos),
            None => (s, "s"),
        };
        let value: u64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(format!("invalid duration unit: {}", unit)),
        }
    }
}
