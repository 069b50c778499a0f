use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file and overridden by the
/// environment variables listed in the external interfaces section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Root directory for workspaces, the SQLite database, and generated
    /// TLS material. Overridden by `DATA_ROOT`.
    #[serde(default = "default_data_root")]
    pub data_root: String,
    /// Path to web client static files, served as a fallback.
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Require a bearer token for the /metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub metrics_require_auth: bool,
    /// Users allowed to access /api/admin/* endpoints (empty = admin panel disabled)
    #[serde(default)]
    pub admin_users: Vec<String>,
}

/// C1 Sandbox Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Master switch. When false, `ensure`/`exec` are skipped and callers
    /// fall back to host execution. Overridden by `SANDBOX_ENABLED`.
    #[serde(default)]
    pub enabled: bool,
    /// Container runtime binary, e.g. `docker` or `podman`.
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
    /// Image tag used for newly created containers. Overridden by
    /// `SANDBOX_IMAGE`.
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    /// Memory cap, e.g. "2g". Overridden by `SANDBOX_MEMORY`.
    #[serde(default = "default_sandbox_memory")]
    pub memory: String,
    /// CPU cap, e.g. "2". Overridden by `SANDBOX_CPUS`.
    #[serde(default = "default_sandbox_cpus")]
    pub cpus: String,
    /// Container network mode. Overridden by `SANDBOX_NETWORK`.
    #[serde(default = "default_sandbox_network")]
    pub network: String,
    /// Container-name prefix; canonical name is `<prefix>-<sanitized(userId)>`.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// Host path to the shared skills directory, mounted read-only.
    /// Overridden by `PI_SKILLS_DIR`.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    /// Host path mounted at `/workspaces` inside every container.
    #[serde(default = "default_workspaces_root")]
    pub workspaces_root: String,
    /// Probe timeout in seconds for `available()`/`imageAvailable()`.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent sessions per process (0 = unlimited).
    #[serde(default)]
    pub max_sessions: u32,
    /// Idle timeout in seconds (0 = disabled).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Debounce window for the file-change watcher, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub watcher_debounce_ms: u64,
}

/// Knobs passed through to the (out-of-scope) agent SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_thinking_level")]
    pub default_thinking_level: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub brave_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            data_root: default_data_root(),
            web_root: default_web_root(),
            metrics_require_auth: true,
            admin_users: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime_binary: default_runtime_binary(),
            image: default_sandbox_image(),
            memory: default_sandbox_memory(),
            cpus: default_sandbox_cpus(),
            network: default_sandbox_network(),
            container_prefix: default_container_prefix(),
            skills_dir: default_skills_dir(),
            workspaces_root: default_workspaces_root(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            idle_timeout: default_idle_timeout(),
            watcher_debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_thinking_level: default_thinking_level(),
            provider: None,
            model: None,
            brave_api_key: None,
        }
    }
}

impl ForgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely
    /// wrong). Returns `Ok(())` if no issues, or `Err(issues)` otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!(
                        "ERROR: tls_cert '{cert}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes"
                    ));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!(
                        "ERROR: tls_key '{key}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes"
                    ));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. Both must be set for \
                     custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. Both must be set for \
                     custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.session.idle_timeout > 0 && self.session.idle_timeout < 60 {
            issues.push(format!(
                "ERROR: session.idle_timeout must be 0 (disabled) or at least 60 seconds, \
                 got {}. Values under 60s will disconnect users too aggressively.",
                self.session.idle_timeout
            ));
        }

        if self.session.watcher_debounce_ms == 0 {
            issues.push(
                "ERROR: session.watcher_debounce_ms must be >= 1.".to_string(),
            );
        }

        for user in &self.server.admin_users {
            let trimmed = user.trim();
            if trimmed != user {
                issues.push(format!(
                    "WARNING: admin_users entry '{user}' has leading/trailing whitespace. \
                     This will never match a login username. Did you mean '{trimmed}'?"
                ));
            } else if user.is_empty() {
                issues.push(
                    "WARNING: admin_users contains an empty string. This entry will never match."
                        .to_string(),
                );
            } else if !user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            {
                issues.push(format!(
                    "WARNING: admin_users entry '{user}' contains characters not allowed in \
                     usernames (only a-z, 0-9, _, -, . are valid). This entry will never match."
                ));
            }
        }

        if self.sandbox.enabled && self.sandbox.runtime_binary.trim().is_empty() {
            issues.push("ERROR: sandbox.runtime_binary must not be empty when sandbox.enabled is true.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Apply the environment-variable overrides named in the external
    /// interfaces section, in order of precedence over the TOML file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DATA_ROOT") {
            self.server.data_root = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_ENABLED") {
            self.sandbox.enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_MEMORY") {
            self.sandbox.memory = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_CPUS") {
            self.sandbox.cpus = v;
        }
        if let Ok(v) = std::env::var("SANDBOX_NETWORK") {
            self.sandbox.network = v;
        }
        if let Ok(v) = std::env::var("PI_SKILLS_DIR") {
            self.sandbox.skills_dir = v;
        }
        if let Ok(v) = std::env::var("DEFAULT_THINKING_LEVEL") {
            self.agent.default_thinking_level = v;
        }
        if let Ok(v) = std::env::var("PI_PROVIDER") {
            self.agent.provider = Some(v);
        }
        if let Ok(v) = std::env::var("PI_MODEL") {
            self.agent.model = Some(v);
        }
        if let Ok(v) = std::env::var("BRAVE_API_KEY") {
            self.agent.brave_api_key = Some(v);
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_data_root() -> String {
    "./data".to_string()
}
fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_true() -> bool {
    true
}
fn default_runtime_binary() -> String {
    "docker".to_string()
}
fn default_sandbox_image() -> String {
    "forge-sandbox:latest".to_string()
}
fn default_sandbox_memory() -> String {
    "2g".to_string()
}
fn default_sandbox_cpus() -> String {
    "2".to_string()
}
fn default_sandbox_network() -> String {
    "bridge".to_string()
}
fn default_container_prefix() -> String {
    "forge".to_string()
}
fn default_skills_dir() -> String {
    "./skills".to_string()
}
fn default_workspaces_root() -> String {
    "/workspaces".to_string()
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_thinking_level() -> String {
    "medium".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: ForgeConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.metrics_require_auth);

        assert!(!config.sandbox.enabled);
        assert_eq!(config.sandbox.runtime_binary, "docker");
        assert_eq!(config.sandbox.workspaces_root, "/workspaces");
        assert_eq!(config.sandbox.probe_timeout_secs, 5);

        assert_eq!(config.session.idle_timeout, 3600);
        assert_eq!(config.session.watcher_debounce_ms, 100);
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(ForgeConfig::default_for_test().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = ForgeConfig::default_for_test();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("port")));
    }

    #[test]
    fn validate_idle_timeout_under_60_is_error() {
        let mut config = ForgeConfig::default_for_test();
        config.session.idle_timeout = 30;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("idle_timeout")));
    }

    #[test]
    fn validate_idle_timeout_zero_is_ok() {
        let mut config = ForgeConfig::default_for_test();
        config.session.idle_timeout = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_admin_user_with_whitespace_is_warning() {
        let mut config = ForgeConfig::default_for_test();
        config.server.admin_users = vec![" alice".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_tls_cert_without_key_is_warning() {
        let mut config = ForgeConfig::default_for_test();
        config.server.tls_cert = Some("cert.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:") && i.contains("tls_key")));
    }

    #[test]
    fn env_overrides_take_precedence() {
        unsafe {
            std::env::set_var("SANDBOX_IMAGE", "custom:tag");
        }
        let mut config = ForgeConfig::default_for_test();
        config.apply_env_overrides();
        assert_eq!(config.sandbox.image, "custom:tag");
        unsafe {
            std::env::remove_var("SANDBOX_IMAGE");
        }
    }

    impl ForgeConfig {
        pub(crate) fn default_for_test() -> Self {
            ForgeConfig {
                server: ServerConfig::default(),
                sandbox: SandboxConfig::default(),
                session: SessionConfig::default(),
                agent: AgentConfig::default(),
            }
        }
    }
}
