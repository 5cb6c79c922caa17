//! Loads the host-configuration table from a TOML file.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::host::HostConfig;
use crate::table::HostConfigTable;

#[derive(serde::Deserialize)]
struct RawFile {
    #[serde(default, rename = "host-types")]
    host_types: HashMap<String, HostConfig>,
}

/// Load and validate a [`HostConfigTable`] from a TOML file.
///
/// ```toml
/// [host-types.linux-amd64]
/// kind = "cloud-vm"
/// machine-type = "n2-standard-8"
/// root-disk-size-gb = 20
/// expected-count = 5
/// ssh-username = "gopher"
/// ```
pub fn load_file(path: impl AsRef<Path>) -> ConfigResult<HostConfigTable> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&content).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Parse and validate a [`HostConfigTable`] from an in-memory TOML string.
pub fn load_str(content: &str) -> ConfigResult<HostConfigTable> {
    let raw: RawFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: Path::new("<string>").to_path_buf(),
        source,
    })?;
    HostConfigTable::new(raw.host_types)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_cloud_entry() {
        let toml = r#"
            [host-types.linux-amd64]
            kind = "cloud-vm"
            machine-type = "n2-standard-8"
            root-disk-size-gb = 20
            expected-count = 5
            ssh-username = "gopher"
        "#;
        let table = load_str(toml).unwrap();
        let entry = table.get("linux-amd64").unwrap();
        assert_eq!(entry.machine_type, "n2-standard-8");
        assert_eq!(entry.root_disk_size_gb, 20);
    }

    #[test]
    fn parses_reverse_entry_without_machine_type() {
        let toml = r#"
            [host-types.darwin-arm64-11]
            kind = "reverse"
        "#;
        let table = load_str(toml).unwrap();
        assert!(table.get("darwin-arm64-11").unwrap().machine_type.is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_file("/nonexistent/host-config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn loads_from_an_actual_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host-config.toml");
        std::fs::write(
            &path,
            r#"
                [host-types.linux-amd64]
                kind = "cloud-vm"
                machine-type = "n2-standard-8"
                root-disk-size-gb = 20
                expected-count = 5
            "#,
        )
        .unwrap();

        let table = load_file(&path).unwrap();
        assert_eq!(table.get("linux-amd64").unwrap().machine_type, "n2-standard-8");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host-config.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
