use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;
use crate::mapping::{parse_mappings, TemplateMapping};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Snapshot file. Unset keeps the snapshot in memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    pub database: DatabaseConfig,
    /// Mapping strings: `<source>[:<destination>[:<service>]]`.
    pub templates: Vec<String>,
    pub watch_debounce_ms: u64,
    pub event_reconnect_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            database: DatabaseConfig::default(),
            templates: Vec::new(),
            watch_debounce_ms: 500,
            event_reconnect_secs: 2,
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("dockgen.toml"))
            .merge(Json::file("dockgen.json"))
            .merge(Env::prefixed("DOCKGEN_").split("__"));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }

        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.templates.extend(cli.templates.iter().cloned());
        if let Some(socket) = &cli.socket_path {
            config.socket_path = Some(socket.clone());
        }

        config.mappings()?;
        Ok(config)
    }

    /// Parses the configured mapping strings.
    pub fn mappings(&self) -> anyhow::Result<Vec<TemplateMapping>> {
        if self.templates.is_empty() {
            anyhow::bail!("No templates configured; pass at least one --template");
        }
        parse_mappings(self.templates.as_slice()).map_err(|e| anyhow::anyhow!("Invalid template: {}", e))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn event_reconnect(&self) -> Duration {
        Duration::from_secs(self.event_reconnect_secs)
    }
}
