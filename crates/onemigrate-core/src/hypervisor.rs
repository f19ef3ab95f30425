//! Source hypervisor inventory.
//!
//! [`VsphereClient`] talks to the vSphere Automation REST API: it opens a
//! session with basic auth, lists VMs, and closes the session again.

use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::SourceCredentials;
use crate::error::{Error, Result};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// A VM as seen by the source hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmSummary {
    /// Inventory identifier, e.g. `vm-42`.
    #[serde(rename = "vm")]
    pub id: String,
    pub name: String,
    /// `POWERED_ON`, `POWERED_OFF` or `SUSPENDED`.
    pub power_state: String,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default, rename = "memory_size_MiB")]
    pub memory_mib: Option<u64>,
}

/// Lists VMs on the source hypervisor.
pub trait Hypervisor {
    fn list_vms(&self) -> Result<Vec<VmSummary>>;
}

/// Blocking vSphere REST client.
pub struct VsphereClient {
    base: Url,
    credentials: SourceCredentials,
    http: Client,
}

impl VsphereClient {
    /// Build a client; no request is made until [`Hypervisor::list_vms`].
    pub fn new(credentials: SourceCredentials) -> Result<Self> {
        let base = Url::parse(&format!("https://{}:{}/", credentials.host, credentials.port))
            .map_err(|e| Error::hypervisor(format!("invalid vCenter address: {}", e)))?;
        let http = Client::builder()
            .danger_accept_invalid_certs(!credentials.verify_ssl)
            .build()?;
        Ok(Self {
            base,
            credentials,
            http,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::hypervisor(format!("invalid API path '{}': {}", path, e)))
    }

    fn login(&self) -> Result<String> {
        info!(host = %self.credentials.host, user = %self.credentials.user, "connecting to vSphere");
        let response = self
            .http
            .post(self.url("api/session")?)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .send()?;
        let token: String = check_status(response, "login")?.json()?;
        Ok(token)
    }

    fn logout(&self, token: &str) {
        let result = self
            .url("api/session")
            .and_then(|url| Ok(self.http.delete(url).header(SESSION_HEADER, token).send()?));
        if let Err(e) = result {
            warn!(error = %e, "failed to close vSphere session");
        }
    }
}

impl Hypervisor for VsphereClient {
    fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let token = self.login()?;

        let result = (|| -> Result<Vec<VmSummary>> {
            let response = self
                .http
                .get(self.url("api/vcenter/vm")?)
                .header(SESSION_HEADER, &token)
                .send()?;
            Ok(check_status(response, "list VMs")?.json()?)
        })();

        self.logout(&token);

        let vms = result?;
        debug!(count = vms.len(), "listed VMs");
        Ok(vms)
    }
}

fn check_status(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_server_error() {
        return Err(Error::http(format!("vSphere {} failed: HTTP {}", action, status)));
    }
    if !status.is_success() {
        return Err(Error::hypervisor(format!("vSphere {} failed: HTTP {}", action, status)));
    }
    Ok(response)
}

/// Keep the VMs whose name matches `pattern`.
///
/// Without `*` or `?` the pattern is a case-insensitive substring; with them
/// it is a case-insensitive wildcard over the whole name. An empty pattern
/// matches everything. Results are sorted by name.
pub fn filter_vms(vms: Vec<VmSummary>, pattern: &str) -> Vec<VmSummary> {
    let pattern = pattern.trim().to_lowercase();
    let mut matched: Vec<VmSummary> = vms
        .into_iter()
        .filter(|vm| name_matches(&vm.name.to_lowercase(), &pattern))
        .collect();
    matched.sort_by(|a, b| a.name.cmp(&b.name));
    matched
}

fn name_matches(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if pattern.contains(['*', '?']) {
        let name: Vec<char> = name.chars().collect();
        let pattern: Vec<char> = pattern.chars().collect();
        wildcard_match(&name, &pattern)
    } else {
        name.contains(pattern)
    }
}

fn wildcard_match(text: &[char], pattern: &[char]) -> bool {
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
