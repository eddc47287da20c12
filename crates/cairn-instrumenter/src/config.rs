use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct InstrumenterConfig {
    /// Address of the authority's bus relay.
    #[serde(default = "default_bus_addr")]
    pub bus_addr: String,
    /// Overrides the probed OS hostname as this node's identity.
    pub hostname: Option<String>,
}

fn default_bus_addr() -> String {
    "127.0.0.1:7701".to_string()
}

impl InstrumenterConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}
