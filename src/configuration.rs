use config::{Config, File, FileFormat, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub const CONFIG_SECTION: &str = "simulation-config";

/// Connection settings shared by the meter and the PV simulator.
///
/// Built once at startup and handed to whoever needs it; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Defaults to `pv_simulation`, the queue both roles agree on out of the box.
    pub queue_name: String,
    /// AMQP port of the broker.
    pub port: u16,
    /// Port of the RabbitMQ management API.
    pub management_port: u16,
    pub vhost: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            queue_name: "pv_simulation".to_string(),
            port: 5672,
            management_port: 15672,
            vhost: "/".to_string(),
        }
    }
}

impl SimulationConfig {
    /// Reads the `[simulation-config]` section of an INI file on top of the
    /// defaults. Problems with the file are reported as warnings and leave the
    /// affected values at their defaults.
    pub fn from_file(path: &Path) -> Self {
        let mut config = Self::default();

        if !path.is_file() {
            warn!("Could not find config file at {}, using defaults", path.display());
            return config;
        }

        let sections = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize::<HashMap<String, Value>>());
        let mut sections = match sections {
            Ok(sections) => sections,
            Err(e) => {
                warn!("Could not parse config file {}: {e}, using defaults", path.display());
                return config;
            }
        };

        let Some(section) = sections
            .remove(CONFIG_SECTION)
            .and_then(|section| section.into_table().ok())
        else {
            warn!(
                "Could not find section '{CONFIG_SECTION}' in config file {}, using defaults",
                path.display()
            );
            return config;
        };

        let mut values: HashMap<String, String> = section
            .into_iter()
            .filter_map(|(key, value)| value.into_string().ok().map(|v| (key, v)))
            .collect();

        for (key, slot) in [
            ("host", &mut config.host),
            ("username", &mut config.username),
            ("password", &mut config.password),
            ("queue_name", &mut config.queue_name),
            ("vhost", &mut config.vhost),
        ] {
            match values.remove(key) {
                Some(value) => *slot = value,
                None => warn!("Option '{key}' missing in {}, leaving it at default", path.display()),
            }
        }

        for (key, slot) in [
            ("port", &mut config.port),
            ("management_port", &mut config.management_port),
        ] {
            if let Some(port) = values.remove(key) {
                match port.parse() {
                    Ok(port) => *slot = port,
                    Err(e) => warn!("Invalid {key} '{port}': {e}, leaving it at default"),
                }
            }
        }

        info!(
            "Loaded config from {}: {}@{} queue '{}'",
            path.display(),
            config.username,
            config.host,
            config.queue_name
        );
        config
    }

    /// Defaults, overridden by `path` when one is given.
    pub fn load(path: Option<&Path>) -> Self {
        path.map(Self::from_file).unwrap_or_default()
    }

    pub fn management_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.management_port)
    }
}
