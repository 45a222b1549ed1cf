//! Broker configuration (§6 "Size limits"): the handful of knobs the spec calls out as
//! implementation-configured, loadable from a TOML file and overridable from the CLI.

use serde::Deserialize;

/// Default `MAX_PATH_LEN`: the longest path a single `VFS_IN_WALK`/`VFS_IN_RENAME` accepts.
pub const DEFAULT_MAX_PATH_LEN: usize = 4096;
/// Default `MAX_MNTOPTS_LEN`.
pub const DEFAULT_MAX_MNTOPTS_LEN: usize = 256;
/// Default `FS_NAME_MAXLEN`.
pub const DEFAULT_FS_NAME_MAXLEN: usize = 20;

/// Broker-wide configuration, deserialized from a TOML file and layered with CLI overrides
/// in `vfsbrokerd`'s `main`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker's client-facing transport listens on.
    pub listen_addr: String,
    /// `MAX_PATH_LEN`.
    pub max_path_len: usize,
    /// `MAX_MNTOPTS_LEN`.
    pub max_mntopts_len: usize,
    /// `FS_NAME_MAXLEN`.
    pub fs_name_maxlen: usize,
    /// Initial capacity hint for each client's file-descriptor table.
    pub fd_table_hint: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4040".to_owned(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
            max_mntopts_len: DEFAULT_MAX_MNTOPTS_LEN,
            fs_name_maxlen: DEFAULT_FS_NAME_MAXLEN,
            fd_table_hint: 16,
        }
    }
}

impl BrokerConfig {
    /// Parse a TOML config file's contents. Missing fields fall back to [`Default`].
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = BrokerConfig::from_toml_str("listen_addr = \"0.0.0.0:9000\"").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.max_path_len, DEFAULT_MAX_PATH_LEN);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config.fs_name_maxlen, DEFAULT_FS_NAME_MAXLEN);
    }
}
