//! OpenNebula XML-RPC client.
//!
//! OpenNebula methods return `[success, value, error_code, ...]`; on failure
//! the second element carries the error message.

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::config::{OpenNebulaSettings, RegistryCredentials};
use crate::error::{Error, Result};
use crate::upload::{ImageId, ImageRegistry, ImageTemplate};
use crate::xmlrpc::{self, Response, Value};

/// Blocking client for an OpenNebula front-end.
#[derive(Debug, Clone)]
pub struct OpenNebulaClient {
    endpoint: String,
    http: Client,
}

impl OpenNebulaClient {
    /// Create a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(settings: &OpenNebulaSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            endpoint: settings.endpoint.clone(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Query the OpenNebula version; doubles as a connectivity check.
    pub fn version(&self, credentials: &RegistryCredentials) -> Result<String> {
        let value = self.call("one.system.version", vec![Value::Str(credentials.session())])?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::xml_rpc("one.system.version returned a non-string value"))
    }

    /// Invoke `method` and unwrap OpenNebula's result triple.
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = xmlrpc::encode_call(method, &params)?;
        debug!(endpoint = %self.endpoint, method, "XML-RPC call");

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "text/xml")
            .body(body)
            .send()?;

        let status = response.status();
        let text = response.text()?;
        if status.is_server_error() {
            return Err(Error::http(format!("{} returned HTTP {}", method, status)));
        }
        if !status.is_success() {
            return Err(Error::registry(format!("{} returned HTTP {}", method, status)));
        }

        match xmlrpc::decode_response(&text)? {
            Response::Fault { code, message } => Err(Error::registry(format!(
                "{} fault {}: {}",
                method, code, message
            ))),
            Response::Params(values) => unwrap_result(method, values),
        }
    }
}

/// Extract the payload of a `[success, value, ...]` result.
fn unwrap_result(method: &str, values: Vec<Value>) -> Result<Value> {
    let result = values
        .into_iter()
        .next()
        .ok_or_else(|| Error::xml_rpc(format!("{} returned no values", method)))?;

    let Value::Array(mut items) = result else {
        return Err(Error::xml_rpc(format!("{} returned a non-array result", method)));
    };
    if items.len() < 2 {
        return Err(Error::xml_rpc(format!("{} returned a short result", method)));
    }

    let success = items[0]
        .as_bool()
        .ok_or_else(|| Error::xml_rpc(format!("{} result has no success flag", method)))?;
    let payload = items.swap_remove(1);

    if success {
        Ok(payload)
    } else {
        let message = payload
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", payload));
        Err(Error::registry(message))
    }
}

impl ImageRegistry for OpenNebulaClient {
    fn allocate(
        &self,
        credentials: &RegistryCredentials,
        template: &ImageTemplate,
        datastore_id: u32,
    ) -> Result<ImageId> {
        let value = self.call(
            "one.image.allocate",
            vec![
                Value::Str(credentials.session()),
                Value::Str(template.render()),
                Value::Int(i64::from(datastore_id)),
            ],
        )?;
        value
            .as_i64()
            .map(ImageId)
            .ok_or_else(|| Error::xml_rpc("one.image.allocate returned a non-integer id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_result_success() {
        let values = vec![Value::Array(vec![
            Value::Bool(true),
            Value::Int(42),
            Value::Int(0),
        ])];
        assert_eq!(unwrap_result("one.image.allocate", values).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_unwrap_result_failure_is_registry_error() {
        let values = vec![Value::Array(vec![
            Value::Bool(false),
            Value::Str("[one.image.allocate] NAME is already taken by IMAGE 7.".to_string()),
            Value::Int(2048),
        ])];
        let err = unwrap_result("one.image.allocate", values).unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("already taken"));
    }

    #[test]
    fn test_unwrap_result_malformed() {
        assert!(unwrap_result("m", vec![]).is_err());
        assert!(unwrap_result("m", vec![Value::Int(1)]).is_err());
        assert!(unwrap_result("m", vec![Value::Array(vec![Value::Bool(true)])]).is_err());
        assert!(unwrap_result("m", vec![Value::Array(vec![Value::Int(1), Value::Int(2)])]).is_err());
    }
}
