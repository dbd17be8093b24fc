use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ConfigureConfig {
    pub host: Option<String>,
    pub iast_host: Option<String>,
    pub asset_group: Option<String>,
    pub retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    /// "odata" (default) or "equality" for the older API generation.
    pub query_style: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ReportConfig {
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub configure: Option<ConfigureConfig>,
    pub report: Option<ReportConfig>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("iastkit.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}
