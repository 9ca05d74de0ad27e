//! Loads a [`RouteConfig`] from a TOML file at startup. The router itself
//! only deals in parsed `RouteConfig`/`serde_json::Value`; this module is
//! the ambient convenience for getting one off disk.

use std::path::Path;

use crate::router::RouteConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load_route_config(path: impl AsRef<Path>) -> Result<RouteConfig, ConfigLoadError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_route_config_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [route_config.discord]
            url = "wss://discord.example/gateway"
            token = "abc123"
            "#
        )
        .unwrap();

        let config = load_route_config(file.path()).unwrap();
        let target = config.route_config.get("discord").unwrap();
        assert_eq!(target.url, "wss://discord.example/gateway");
        assert_eq!(target.token.as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_route_config("/nonexistent/path/route.toml").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Read { .. }));
    }
}
