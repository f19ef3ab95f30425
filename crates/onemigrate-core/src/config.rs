//! Settings document and credentials.
//!
//! Settings are loaded once from a YAML document and handed to each phase as
//! an immutable slice. Secrets never live in the settings document; they are
//! read from the environment.

use std::env;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default location of the settings document, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.yaml";

/// Environment variable carrying OpenNebula credentials as `user:password`.
pub const OPENNEBULA_AUTH_VAR: &str = "OPENNEBULA_AUTH";

/// Environment variable carrying the vSphere password.
pub const VMWARE_PASSWORD_VAR: &str = "VMWARE_PASSWORD";

/// Top-level settings document.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub app: AppSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub vmware: Option<VmwareSettings>,
    pub opennebula: OpenNebulaSettings,
}

/// `app` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    /// Root of the staging tree.
    pub staging_path: PathBuf,
    /// Log level used when neither `RUST_LOG` nor `--log-level` is given.
    #[serde(default)]
    pub log_level: Option<String>,
}

/// `tools` section: external binaries and their time budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub qemu_img: String,
    pub ovftool: String,
    pub export_timeout_secs: u64,
    pub convert_timeout_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".to_string(),
            ovftool: "ovftool".to_string(),
            export_timeout_secs: 6 * 60 * 60,
            convert_timeout_secs: 4 * 60 * 60,
        }
    }
}

impl ToolSettings {
    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }
}

/// `vmware` section: where VMs are exported from and listed.
#[derive(Debug, Clone, Deserialize)]
pub struct VmwareSettings {
    pub host: String,
    pub user: String,
    #[serde(default = "default_vmware_port")]
    pub port: u16,
    #[serde(default)]
    pub verify_ssl: bool,
}

fn default_vmware_port() -> u16 {
    443
}

/// `opennebula` section: the destination image registry.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenNebulaSettings {
    /// XML-RPC endpoint, e.g. `http://localhost:2633/RPC2`.
    pub endpoint: String,
    /// Datastore images are registered into.
    pub default_datastore_id: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts for a registration that fails in transport (1 = no retry).
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_upload_attempts() -> u32 {
    1
}

impl OpenNebulaSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Settings {
    /// Load and validate the settings document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] if the file does not exist and
    /// [`Error::Config`] if it cannot be parsed or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::config_missing(path)),
            Err(e) => return Err(Error::io(e, path)),
        };
        Self::from_yaml(&content)
    }

    /// Parse and validate a settings document from a string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid settings document: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.app.staging_path.as_os_str().is_empty() {
            return Err(Error::config("app.staging_path must not be empty"));
        }
        if self.opennebula.endpoint.trim().is_empty() {
            return Err(Error::config("opennebula.endpoint must not be empty"));
        }
        if self.opennebula.upload_attempts == 0 {
            return Err(Error::config("opennebula.upload_attempts must be at least 1"));
        }
        if self.tools.export_timeout_secs == 0 || self.tools.convert_timeout_secs == 0 {
            return Err(Error::config("tool timeouts must be greater than zero"));
        }
        if let Some(vmware) = &self.vmware {
            if vmware.host.trim().is_empty() {
                return Err(Error::config("vmware.host must not be empty"));
            }
        }
        Ok(())
    }
}

/// OpenNebula session credentials (`user:password`).
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    user: String,
    password: String,
}

impl RegistryCredentials {
    /// Parse a `user:password` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no `:` or either side is empty.
    pub fn parse(auth: &str) -> Result<Self> {
        let (user, password) = auth
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::config(format!("{} must be in user:password form", OPENNEBULA_AUTH_VAR)))?;
        if user.is_empty() || password.is_empty() {
            return Err(Error::config(format!(
                "{} must be in user:password form",
                OPENNEBULA_AUTH_VAR
            )));
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Read credentials from [`OPENNEBULA_AUTH_VAR`].
    ///
    /// Returns `Ok(None)` when the variable is unset or empty.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_value(env::var(OPENNEBULA_AUTH_VAR).ok().as_deref())
    }

    /// Parse an optional `user:password` value; unset or blank is `Ok(None)`.
    pub fn from_value(auth: Option<&str>) -> Result<Option<Self>> {
        match auth {
            Some(value) if !value.trim().is_empty() => Self::parse(value).map(Some),
            _ => Ok(None),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The XML-RPC session string.
    pub fn session(&self) -> String {
        format!("{}:{}", self.user, self.password)
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to log in to vSphere.
#[derive(Clone)]
pub struct SourceCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub verify_ssl: bool,
}

impl SourceCredentials {
    /// Combine the `vmware` settings section with [`VMWARE_PASSWORD_VAR`].
    ///
    /// Returns `None` if the section or the password is missing.
    pub fn from_settings(settings: Option<&VmwareSettings>) -> Option<Self> {
        let vmware = settings?;
        let password = env::var(VMWARE_PASSWORD_VAR).ok().filter(|p| !p.is_empty())?;
        Some(Self::new(vmware, password))
    }

    pub fn new(vmware: &VmwareSettings, password: impl Into<String>) -> Self {
        Self {
            host: vmware.host.clone(),
            port: vmware.port,
            user: vmware.user.clone(),
            password: password.into(),
            verify_ssl: vmware.verify_ssl,
        }
    }
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}
