//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigResult, PalaverConfig};

const PROJECT_FILE: &str = "palaver.toml";
const LOCAL_FILE: &str = "palaver.local.toml";

/// Builder-style loader merging defaults, files, and environment.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "PALAVER".to_string(),
        }
    }

    /// Sets the project directory to search for configuration files.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: "PALAVER").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence, then
    /// validates the resulting replica table.
    pub fn load(self) -> ConfigResult<PalaverConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults (the development topology).
        let defaults = PalaverConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Project config (palaver.toml).
        let project_file = self.project_dir.join(PROJECT_FILE);
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Local overrides (palaver.local.toml, gitignored).
        let local_file = self.project_dir.join(LOCAL_FILE);
        if local_file.exists() {
            builder = builder.add_source(
                config::File::from(local_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Environment variables (PALAVER_*).
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let cfg: PalaverConfig = merged.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_when_no_files_exist() {
        let dir = tempdir().unwrap();
        let cfg = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(cfg, PalaverConfig::default());
    }

    #[test]
    fn project_file_replaces_the_replica_table() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("palaver.toml"),
            r#"
data_dir = "/var/lib/palaver"

[[replicas]]
name = "north"
host = "10.0.0.1"
internal_port = 7001
client_port = 7002
health_port = 7003
notif_port = 7004

[[replicas]]
name = "south"
host = "10.0.0.2"
internal_port = 7001
client_port = 7002
health_port = 7003
notif_port = 7004
"#,
        )
        .unwrap();

        let cfg = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/palaver"));
        assert_eq!(cfg.replicas.len(), 2);
        assert_eq!(cfg.replica("north").unwrap().host, "10.0.0.1");
        // "north" < "south": north listens, south dials.
        assert_eq!(cfg.num_listens("north"), 1);
        assert_eq!(cfg.dial_targets("south").len(), 1);
    }

    #[test]
    fn local_file_overrides_project_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("palaver.toml"), "data_dir = \"project\"\n").unwrap();
        fs::write(dir.path().join("palaver.local.toml"), "data_dir = \"local\"\n").unwrap();

        let cfg = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("local"));
    }

    #[test]
    fn invalid_table_is_rejected_at_load() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("palaver.toml"), "replicas = []\n").unwrap();

        let err = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .unwrap_err();
        assert!(matches!(err, crate::ConfigError::EmptyReplicaTable));
    }
}
