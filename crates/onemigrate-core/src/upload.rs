//! Upload phase: register a converted disk in the destination catalog.

use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{OpenNebulaSettings, RegistryCredentials, OPENNEBULA_AUTH_VAR};
use crate::error::Result;
use crate::job::StagedArtifact;
use crate::phase::{PhaseFailure, PhaseResult};

/// Suffix marking the disk index in catalog names.
pub const DISK_INDEX_TOKEN: &str = "disk0";

/// Pause between registration attempts, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Catalog name for the first disk of `vm_name`.
pub fn catalog_name(vm_name: &str) -> String {
    format!("{}-{}", vm_name, DISK_INDEX_TOKEN)
}

/// Identifier assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub i64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration template for a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTemplate {
    pub name: String,
    pub path: String,
    pub image_type: String,
    pub driver: String,
    pub description: String,
}

impl ImageTemplate {
    /// Template for an OS disk backed by `artifact`.
    pub fn for_artifact(artifact: &StagedArtifact) -> Self {
        Self {
            name: catalog_name(&artifact.vm_name),
            path: artifact.path.display().to_string(),
            image_type: "OS".to_string(),
            driver: artifact.format.tool_name().to_string(),
            description: format!("Migrated from VMware by onemigrate ({})", artifact.vm_name),
        }
    }

    /// Render in OpenNebula template syntax.
    pub fn render(&self) -> String {
        [
            ("NAME", &self.name),
            ("PATH", &self.path),
            ("TYPE", &self.image_type),
            ("DRIVER", &self.driver),
            ("DESCRIPTION", &self.description),
        ]
        .iter()
        .map(|(key, value)| format!("{} = \"{}\"\n", key, escape_template_value(value)))
        .collect()
    }
}

fn escape_template_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Destination image catalog.
pub trait ImageRegistry {
    /// Allocate a new image from `template` in `datastore_id`.
    fn allocate(
        &self,
        credentials: &RegistryCredentials,
        template: &ImageTemplate,
        datastore_id: u32,
    ) -> Result<ImageId>;
}

/// An image the registry accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredImage {
    pub id: ImageId,
    pub name: String,
    pub datastore_id: u32,
}

/// Register `artifact` in the catalog.
///
/// Transport failures are retried up to `settings.upload_attempts` times in
/// total; rejections from the registry itself are not.
pub fn upload(
    artifact: &StagedArtifact,
    settings: &OpenNebulaSettings,
    credentials: Option<&RegistryCredentials>,
    registry: &dyn ImageRegistry,
) -> PhaseResult<RegisteredImage> {
    let credentials = credentials.ok_or_else(|| {
        PhaseFailure::missing_credentials(format!("{} is not set", OPENNEBULA_AUTH_VAR))
    })?;

    let template = ImageTemplate::for_artifact(artifact);
    let datastore_id = settings.default_datastore_id;
    let attempts = settings.upload_attempts.max(1);

    info!(
        image = %template.name,
        datastore = datastore_id,
        user = credentials.user(),
        "registering image"
    );

    let mut attempt = 1;
    loop {
        match registry.allocate(credentials, &template, datastore_id) {
            Ok(id) => {
                info!(image = %template.name, %id, "image registered");
                return Ok(RegisteredImage {
                    id,
                    name: template.name,
                    datastore_id,
                });
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, attempts, error = %e, "registration failed, retrying");
                thread::sleep(RETRY_BACKOFF * attempt);
                attempt += 1;
            }
            Err(e) => return Err(PhaseFailure::registration_rejected(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DiskFormat;

    #[test]
    fn test_catalog_name_differs_from_vm_name() {
        assert_eq!(catalog_name("web01"), "web01-disk0");
        assert_ne!(catalog_name("web01"), "web01");
    }

    #[test]
    fn test_template_for_artifact() {
        let artifact = StagedArtifact::new("/tmp/stage/web01/web01.qcow2", DiskFormat::Qcow2, "web01");
        let template = ImageTemplate::for_artifact(&artifact);
        assert_eq!(template.name, "web01-disk0");
        assert_eq!(template.path, "/tmp/stage/web01/web01.qcow2");
        assert_eq!(template.image_type, "OS");
        assert_eq!(template.driver, "qcow2");
    }

    #[test]
    fn test_render_template() {
        let template = ImageTemplate {
            name: "web01-disk0".to_string(),
            path: "/tmp/stage/web01/web01.qcow2".to_string(),
            image_type: "OS".to_string(),
            driver: "qcow2".to_string(),
            description: "say \"hi\"".to_string(),
        };
        let rendered = template.render();
        assert!(rendered.contains("NAME = \"web01-disk0\"\n"));
        assert!(rendered.contains("PATH = \"/tmp/stage/web01/web01.qcow2\"\n"));
        assert!(rendered.contains("TYPE = \"OS\"\n"));
        assert!(rendered.contains("DRIVER = \"qcow2\"\n"));
        assert!(rendered.contains("DESCRIPTION = \"say \\\"hi\\\"\"\n"));
    }

    #[test]
    fn test_escape_template_value() {
        assert_eq!(escape_template_value(r#"C:\vm "a""#), r#"C:\\vm \"a\""#);
    }
}
