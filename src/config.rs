//! Controller Configuration
//!
//! Defaults cover a standalone controller. A YAML file may override any
//! field; the binary overlays its command line arguments afterwards.
//!
//! ```yaml
//! tcpPortRange: { min: 7000, max: 7999 }
//! minorNumberRange: { min: 1000, max: 49999 }
//! defaultStorPool: DfltStorPool
//! databasePath: /var/lib/topology/db.json
//! ```

use crate::domain::{MinorNumber, NumberRange, StorPoolName, TcpPortNumber};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default storage pool assigned to volumes without an explicit pool
pub const DEFAULT_STOR_POOL: &str = "DfltStorPool";

/// Storage pool of diskless resources
pub const DEFAULT_DISKLESS_STOR_POOL: &str = "DfltDisklessStorPool";

/// Configuration of one controller instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Ports handed out to new resource definitions
    pub tcp_port_range: NumberRange,
    /// Minor numbers handed out to new volume definitions
    pub minor_number_range: NumberRange,
    pub default_stor_pool: String,
    pub default_diskless_stor_pool: String,
    /// Backing file of the database; in-memory when unset
    pub database_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tcp_port_range: NumberRange::new(7000, 7999),
            minor_number_range: NumberRange::new(1000, 49999),
            default_stor_pool: DEFAULT_STOR_POOL.to_string(),
            default_diskless_stor_pool: DEFAULT_DISKLESS_STOR_POOL.to_string(),
            database_path: None,
        }
    }
}

impl ControllerConfig {
    /// Reads and validates a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_range("TCP port range", self.tcp_port_range, TcpPortNumber::MIN, TcpPortNumber::MAX)?;
        check_range(
            "minor number range",
            self.minor_number_range,
            MinorNumber::MIN,
            MinorNumber::MAX,
        )?;
        for (what, name) in [
            ("default storage pool", &self.default_stor_pool),
            ("diskless storage pool", &self.default_diskless_stor_pool),
        ] {
            StorPoolName::new(name).map_err(|err| Error::Configuration(format!("Invalid {}: {}", what, err)))?;
        }
        if self.default_stor_pool.eq_ignore_ascii_case(&self.default_diskless_stor_pool) {
            return Err(Error::Configuration(
                "Default and diskless storage pools must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Default storage pool as a checked name
    pub fn default_stor_pool_name(&self) -> Result<StorPoolName> {
        StorPoolName::new(&self.default_stor_pool)
    }

    pub fn diskless_stor_pool_name(&self) -> Result<StorPoolName> {
        StorPoolName::new(&self.default_diskless_stor_pool)
    }
}

fn check_range(what: &str, range: NumberRange, min: i64, max: i64) -> Result<()> {
    if range.min > range.max {
        return Err(Error::Configuration(format!("Empty {} {}", what, range)));
    }
    if range.min < min || range.max > max {
        return Err(Error::Configuration(format!(
            "{} {} exceeds [{}, {}]",
            what, range, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tcp_port_range, NumberRange::new(7000, 7999));
        assert_eq!(config.minor_number_range, NumberRange::new(1000, 49999));
        assert_eq!(config.default_stor_pool_name().unwrap().display_name(), "DfltStorPool");
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_from_file_overrides_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tcpPortRange: {{ min: 7100, max: 7199 }}").unwrap();
        writeln!(file, "defaultStorPool: fast_pool").unwrap();
        let config = ControllerConfig::from_file(file.path()).unwrap();

        assert_eq!(config.tcp_port_range, NumberRange::new(7100, 7199));
        assert_eq!(config.default_stor_pool, "fast_pool");
        assert_eq!(config.minor_number_range, NumberRange::new(1000, 49999));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let config = ControllerConfig {
            tcp_port_range: NumberRange::new(8000, 7000),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let config = ControllerConfig {
            minor_number_range: NumberRange::new(0, 1 << 21),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let config = ControllerConfig {
            default_diskless_stor_pool: "dfltstorpool".into(),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "unknownField: 1").unwrap();
        assert_matches!(ControllerConfig::from_file(file.path()), Err(Error::Yaml(_)));
    }
}
