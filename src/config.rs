//! Configuration file loading.
//!
//! Grounded on the teacher's `src/config.rs` (`toml`+`serde`,
//! `Config::load` reading a file into a typed struct) and extended to the
//! full field set `original_source/floranet/models/config.py` validates.
//! The on-disk shape is a flat `[server]` table plus a `[logging]` table,
//! deliberately not the Python `ConfigParser` ini-with-hex-strings shape —
//! TOML gives us real integers so there's no hex-string parsing step.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::models::{self, FreqBand};

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub listen: IpAddr,
    pub port: u16,
    pub webport: u16,
    pub apitoken: String,
    pub freqband: FreqBand,
    pub netid: u32,
    pub otaastart: u32,
    pub otaaend: u32,
    #[serde(default = "default_duplicateperiod")]
    pub duplicateperiod: u32,
    #[serde(default)]
    pub fcrelaxed: bool,
    #[serde(default)]
    pub macqueueing: bool,
    #[serde(default = "default_macqueuelimit")]
    pub macqueuelimit: u32,
    #[serde(default)]
    pub adrenable: bool,
    #[serde(default)]
    pub adrmargin: i32,
    #[serde(default = "default_adrcycletime")]
    pub adrcycletime: u32,
    #[serde(default = "default_adrmessagetime")]
    pub adrmessagetime: u32,
}

fn default_duplicateperiod() -> u32 {
    5
}
fn default_macqueuelimit() -> u32 {
    300
}
fn default_adrcycletime() -> u32 {
    90
}
fn default_adrmessagetime() -> u32 {
    30
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: FileConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        config.to_model().check().map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }

    pub fn to_model(&self) -> models::Config {
        models::Config {
            name: self.server.name.clone(),
            listen: self.server.listen,
            port: self.server.port,
            webport: self.server.webport,
            apitoken: self.server.apitoken.clone(),
            freqband: self.server.freqband,
            netid: self.server.netid,
            otaastart: self.server.otaastart,
            otaaend: self.server.otaaend,
            duplicateperiod: self.server.duplicateperiod,
            fcrelaxed: self.server.fcrelaxed,
            macqueueing: self.server.macqueueing,
            macqueuelimit: self.server.macqueuelimit,
            adrenable: self.server.adrenable,
            adrmargin: self.server.adrmargin,
            adrcycletime: self.server.adrcycletime,
            adrmessagetime: self.server.adrmessagetime,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        let model = models::Config::defaults();
        Self {
            server: ServerSection {
                name: model.name,
                listen: model.listen,
                port: model.port,
                webport: model.webport,
                apitoken: model.apitoken,
                freqband: model.freqband,
                netid: model.netid,
                otaastart: model.otaastart,
                otaaend: model.otaaend,
                duplicateperiod: model.duplicateperiod,
                fcrelaxed: model.fcrelaxed,
                macqueueing: model.macqueueing,
                macqueuelimit: model.macqueuelimit,
                adrenable: model.adrenable,
                adrmargin: model.adrmargin,
                adrcycletime: model.adrcycletime,
                adrmessagetime: model.adrmessagetime,
            },
            logging: LoggingSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [server]
            name = "test-server"
            listen = "0.0.0.0"
            port = 1700
            webport = 8080
            apitoken = "secret"
            freqband = "US915"
            netid = 19
            otaastart = 1
            otaaend = 254
        "#;
        let parsed: FileConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(parsed.server.name, "test-server");
        assert_eq!(parsed.server.duplicateperiod, 5);
        let model = parsed.to_model();
        assert!(model.check().is_ok());
    }

    #[test]
    fn default_config_passes_its_own_validation() {
        let config = FileConfig::default();
        assert!(config.to_model().check().is_ok());
    }
}
