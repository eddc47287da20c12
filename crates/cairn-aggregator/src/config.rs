use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AggregatorConfig {
    /// Address of the authority's bus relay.
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    /// Overrides the probed OS hostname as this node's identity.
    pub hostname: Option<String>,
    /// Port advertised for raw value reads over HTTP.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_bus_addr() -> String {
    "127.0.0.1:7701".to_string()
}

fn default_http_port() -> u16 {
    7751
}

impl AggregatorConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
