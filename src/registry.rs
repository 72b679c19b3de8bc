//! Publishes container endpoints into an external TTL key-value store.
//! The registry is an out-of-scope external collaborator, so this module
//! defines the trait seam plus a small `reqwest`-backed HTTP PUT
//! implementation, following the same "trait + one concrete
//! implementation" shape `watcher.rs` uses for the config watcher.

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Error, ErrorKind};
use crate::manifest::RegistrationSpec;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Writes `key -> value` with the given TTL in seconds. Failures are
    /// the caller's to log; they never tear down the container that
    /// produced the write.
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error>;
}

/// Registers one container replica's endpoint, matching the key format
/// `<prefix><service>/<ip>:<index>:<containerPort-with-slash-replaced>`.
pub fn registration_key(prefix: &str, service: &str, ip: &str, index: usize, container_port: &str) -> String {
    let port = container_port.replace('/', "_");
    format!("{prefix}{service}/{ip}:{index}:{port}")
}

pub fn registration_value(ip: &str, host_port: &str) -> String {
    format!("{ip}:{host_port}")
}

/// Writes endpoints to an HTTP PUT-based store (e.g. an etcd/consul-style
/// HTTP gateway). Construction fails fast if no host IP is configured —
/// a registry with nothing to publish against is a configuration error,
/// not a runtime condition to tolerate.
pub struct HttpRegistry {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(spec: &RegistrationSpec) -> Result<Self, Error> {
        if spec.ip.is_none() {
            return Err(Error::custom(
                ErrorKind::ConfigValidate,
                "Registration.Ip must be set to register endpoints",
            ));
        }
        let endpoint = spec
            .endpoint
            .clone()
            .ok_or_else(|| Error::custom(ErrorKind::ConfigValidate, "Registration.Endpoint must be set"))?;
        Ok(Self {
            endpoint,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), Error> {
        let url = format!("{}/{key}", self.endpoint.trim_end_matches('/'));
        let result = self
            .client
            .put(&url)
            .query(&[("ttl", ttl_seconds.to_string())])
            .body(value.to_string())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                warn!(status = %response.status(), %key, "registry write rejected");
                Err(Error::custom(ErrorKind::RegistryWrite, "registry rejected write"))
            }
            Err(err) => {
                warn!(%err, %key, "registry write failed");
                Err(Error::source(ErrorKind::RegistryWrite, err))
            }
        }
    }
}

/// Drops every write silently; used when `Registration` is absent or a
/// service has `register = false`.
pub struct NullRegistry;

#[async_trait]
impl Registry for NullRegistry {
    async fn put(&self, _key: &str, _value: &str, _ttl_seconds: u64) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_key_replaces_slash_in_port() {
        let key = registration_key("prod_", "web", "10.0.0.5", 2, "8080/tcp");
        assert_eq!(key, "prod_web/10.0.0.5:2:8080_tcp");
    }

    #[tokio::test]
    async fn null_registry_always_succeeds() {
        assert!(NullRegistry.put("k", "v", 60).await.is_ok());
    }
}
