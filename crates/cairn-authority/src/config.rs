use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AuthorityConfig {
    /// Address the embedded bus relay listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Overrides the probed OS hostname as this node's identity.
    pub hostname: Option<String>,
    /// Granularities above one second must be a multiple of this step.
    #[serde(default = "default_granularity_step")]
    pub granularity_step: u64,
    /// Deadline for enable/disable commands sent to agents.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7701".to_string()
}

fn default_granularity_step() -> u64 {
    5
}

fn default_command_timeout_secs() -> u64 {
    10
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            hostname: None,
            granularity_step: default_granularity_step(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl AuthorityConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
