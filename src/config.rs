//! Server configuration: a TOML file with `GIT_TRANSPORT_*` environment overrides on top.
//!
//! Every field has a default, so an empty file (or no file at all) yields a server listening for
//! HTTP on `0.0.0.0:8080` and SSH on `0.0.0.0:8022`, serving on-disk repositories under `repos/`
//! with the embedded backend.

use std::path::{Path, PathBuf};

use serde::{
    Deserialize, Deserializer, Serialize,
    de::{DeserializeOwned, IntoDeserializer, value::StrDeserializer},
};

use crate::{backend::BackendKind, internal::pack::decode::PackLimits, storage::StorageMode};

/// Prefix of every environment override, e.g. `GIT_TRANSPORT_GIT_BACKEND=subprocess`.
pub const ENV_PREFIX: &str = "GIT_TRANSPORT_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub ssh: SshConfig,
    pub git: GitConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(deserialize_with = "port_or_address")]
    pub listen: String,
    /// Capacity, in chunks, of the channel between a running session and the response body.
    pub channel_message_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            channel_message_size: 16,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    #[serde(deserialize_with = "port_or_address")]
    pub listen: String,
    /// PEM encoded host key on disk.
    pub host_key_path: Option<PathBuf>,
    /// Base64 of the PEM text, for deployments that pass secrets through the environment.
    pub host_key_base64: Option<String>,
    pub host_key_passphrase: Option<String>,
    pub server_id: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8022".to_string(),
            host_key_path: None,
            host_key_base64: None,
            host_key_passphrase: None,
            server_id: format!("SSH-2.0-git-transport_{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    pub backend: BackendKind,
    pub storage: StorageMode,
    pub storage_root: PathBuf,
    pub default_branch: String,
    pub git_binary: PathBuf,
    /// Domain used for SSH commands that name a bare repository (single-tenant mode).
    pub default_domain: Option<String>,
    /// Create a missing repository on first access instead of answering not found.
    pub auto_create: bool,
    /// Largest object count a pushed pack may declare.
    pub max_pack_objects: u32,
    /// Largest inflated size of one pushed object, in bytes.
    pub max_object_size: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Embedded,
            storage: StorageMode::Fs,
            storage_root: PathBuf::from("repos"),
            default_branch: "main".to_string(),
            git_binary: PathBuf::from("git"),
            default_domain: None,
            auto_create: false,
            max_pack_objects: PackLimits::default().max_objects,
            max_object_size: PackLimits::default().max_object_size,
        }
    }
}

impl GitConfig {
    pub fn pack_limits(&self) -> PackLimits {
        PackLimits {
            max_objects: self.max_pack_objects,
            max_object_size: self.max_object_size,
        }
    }
}

impl ServerConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load `path` if given, then apply overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `GIT_TRANSPORT_<SECTION>_<FIELD>` overrides; unrelated variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "HTTP_LISTEN" => self.http.listen = normalize_listen(&value),
                "HTTP_CHANNEL_MESSAGE_SIZE" => {
                    self.http.channel_message_size = parse_value(&key, &value)?
                }
                "SSH_LISTEN" => self.ssh.listen = normalize_listen(&value),
                "SSH_HOST_KEY_PATH" => self.ssh.host_key_path = Some(PathBuf::from(value)),
                "SSH_HOST_KEY_BASE64" => self.ssh.host_key_base64 = Some(value),
                "SSH_HOST_KEY_PASSPHRASE" => self.ssh.host_key_passphrase = Some(value),
                "SSH_SERVER_ID" => self.ssh.server_id = value,
                "GIT_BACKEND" => self.git.backend = parse_enum(&key, &value)?,
                "GIT_STORAGE" => self.git.storage = parse_enum(&key, &value)?,
                "GIT_STORAGE_ROOT" => self.git.storage_root = PathBuf::from(value),
                "GIT_DEFAULT_BRANCH" => self.git.default_branch = value,
                "GIT_BINARY" => self.git.git_binary = PathBuf::from(value),
                "GIT_DEFAULT_DOMAIN" => {
                    self.git.default_domain = (!value.is_empty()).then_some(value)
                }
                "GIT_AUTO_CREATE" => self.git.auto_create = parse_value(&key, &value)?,
                "GIT_MAX_PACK_OBJECTS" => self.git.max_pack_objects = parse_value(&key, &value)?,
                "GIT_MAX_OBJECT_SIZE" => self.git.max_object_size = parse_value(&key, &value)?,
                _ => tracing::warn!(variable = %key, "ignoring unknown configuration override"),
            }
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parse an enum through its serde representation, so aliases work the same as in the file.
fn parse_enum<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    let lower = value.to_ascii_lowercase();
    let deserializer: StrDeserializer<'_, serde::de::value::Error> =
        lower.as_str().into_deserializer();
    T::deserialize(deserializer).map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// A bare port means every interface.
fn normalize_listen(value: &str) -> String {
    if value.parse::<u16>().is_ok() {
        format!("0.0.0.0:{value}")
    } else {
        value.to_string()
    }
}

fn port_or_address<'deserialize, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortOrAddress {
        String(String),
        Port(u16),
    }

    Ok(match PortOrAddress::deserialize(deserializer)? {
        PortOrAddress::String(v) => normalize_listen(&v),
        PortOrAddress::Port(v) => format!("0.0.0.0:{v}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.http.listen, "0.0.0.0:8080");
        assert_eq!(config.ssh.listen, "0.0.0.0:8022");
        assert_eq!(config.git.backend, BackendKind::Embedded);
        assert_eq!(config.git.default_branch, "main");
    }

    #[test]
    fn test_toml_file_with_aliases() {
        let config = ServerConfig::from_toml(
            r#"
            [http]
            listen = 9000

            [ssh]
            listen = "127.0.0.1:2222"
            host_key_path = "/etc/git/host_key"

            [git]
            backend = "bin"
            storage = "mem"
            default_domain = "acme"
            auto_create = true
            "#,
        )
        .unwrap();
        assert_eq!(config.http.listen, "0.0.0.0:9000");
        assert_eq!(config.ssh.listen, "127.0.0.1:2222");
        assert_eq!(config.ssh.host_key_path, Some(PathBuf::from("/etc/git/host_key")));
        assert_eq!(config.git.backend, BackendKind::Subprocess);
        assert_eq!(config.git.storage, StorageMode::Mem);
        assert_eq!(config.git.default_domain.as_deref(), Some("acme"));
        assert!(config.git.auto_create);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env([
                ("GIT_TRANSPORT_GIT_BACKEND".to_string(), "Go".to_string()),
                ("GIT_TRANSPORT_SSH_LISTEN".to_string(), "2022".to_string()),
                ("GIT_TRANSPORT_GIT_AUTO_CREATE".to_string(), "true".to_string()),
                ("GIT_TRANSPORT_GIT_DEFAULT_BRANCH".to_string(), "trunk".to_string()),
                ("GIT_TRANSPORT_GIT_MAX_OBJECT_SIZE".to_string(), "1048576".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.git.backend, BackendKind::Embedded);
        assert_eq!(config.ssh.listen, "0.0.0.0:2022");
        assert!(config.git.auto_create);
        assert_eq!(config.git.default_branch, "trunk");
        assert_eq!(config.git.pack_limits().max_object_size, 1 << 20);

        let err = config
            .apply_env([("GIT_TRANSPORT_GIT_STORAGE".to_string(), "s3".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
