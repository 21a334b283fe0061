use crate::error::Result;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scanner: ScannerSettings,
    pub resolver: ResolverSettings,
    pub tracer: TracerSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub ignore: Vec<String>,   // Extra remote IPs never treated as peers
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            command: "netstat".to_string(),
            args: vec!["-natp".to_string()],
            ignore: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoBackend {
    #[default]
    Http,
    MaxMind,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub backend: GeoBackend,
    pub geolocation_url: String,   // IP is appended
    pub external_ip_url: String,
    pub timeout_secs: u64,
    pub geoip_db: Option<PathBuf>, // Path to GeoLite2-City.mmdb database
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            backend: GeoBackend::Http,
            geolocation_url: "https://geolocation-db.com/json/".to_string(),
            external_ip_url: "https://api.ipify.org".to_string(),
            timeout_secs: 5,
            geoip_db: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TracerSettings {
    pub command: String,
    pub args: Vec<String>,         // Destination is appended
    pub parallel: bool,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            command: "traceroute".to_string(),
            args: ["-m", "30", "-w", "3"].iter().map(|s| s.to_string()).collect(),
            parallel: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub fast_interval_secs: f64,
    pub slow_interval_secs: f64,
    pub node_radius: f64,
    pub path_resolution: f64,      // Degrees per great-circle step
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fast_interval_secs: 2.0,
            slow_interval_secs: 5.0,
            node_radius: crate::topology::DEFAULT_NODE_RADIUS,
            path_resolution: 2.0,
        }
    }
}

impl SessionSettings {
    pub fn fast_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.fast_interval_secs).unwrap_or(Duration::from_secs(2))
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.slow_interval_secs).unwrap_or(Duration::from_secs(5))
    }
}

impl Settings {
    /// Load from the default location; a missing or broken file gives defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("netglobe")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.scanner.command, "netstat");
        assert_eq!(settings.resolver.backend, GeoBackend::Http);
        assert_eq!(settings.session.fast_interval(), Duration::from_secs(2));
        assert_eq!(settings.session.slow_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[resolver]
backend = "maxmind"
geoip_db = "/tmp/GeoLite2-City.mmdb"

[tracer]
parallel = true

[scanner]
ignore = ["192.0.2.10"]
"#,
        )
        .unwrap();
        assert_eq!(settings.resolver.backend, GeoBackend::MaxMind);
        assert_eq!(settings.resolver.timeout_secs, 5);
        assert_eq!(settings.resolver.geoip_db, Some(PathBuf::from("/tmp/GeoLite2-City.mmdb")));
        assert!(settings.tracer.parallel);
        assert_eq!(settings.tracer.command, "traceroute");
        assert_eq!(settings.scanner.ignore, vec!["192.0.2.10".to_string()]);
        assert_eq!(settings.scanner.args, vec!["-natp".to_string()]);
    }

    #[test]
    fn bad_interval_falls_back() {
        let settings: Settings = toml::from_str("[session]\nfast_interval_secs = -1.0\n").unwrap();
        assert_eq!(settings.session.fast_interval(), Duration::from_secs(2));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load_from(Path::new("/nonexistent/netglobe.toml")).is_err());
    }
}
