//! Configuration loader with environment variable expansion

use super::{expand_env_vars, Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server:
  address: "127.0.0.1:1080"
store:
  bucket: userdata
  region: us-east-1
  endpoint: "https://s3.wasabisys.com"
"#
        )
        .unwrap();

        let config = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(config.server.upload_path, "/files");
        assert_eq!(config.store.bucket, "userdata");
        assert_eq!(config.store.part_size, 8 * 1024 * 1024);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server:
  address: "127.0.0.1:1080"
  upload_path: "files"
store:
  bucket: userdata
  region: us-east-1
"#
        )
        .unwrap();

        assert!(ConfigLoader::load(file.path()).is_err());
    }
}
