//! HTTP health probing against an inspected container: issues a single
//! `hyper::Client` GET and treats exactly `200 OK` as healthy, resolving
//! the host port from the container's own `NetworkSettings` since a
//! service may bind an ephemeral host port. `hyper::Client::new()` has
//! no TLS connector, so `https` probes are rejected at manifest
//! validation time (see `manifest::ServiceSpec::validate`) rather than
//! silently failing every probe tick.

use bollard::service::ContainerInspectResponse;
use hyper::{Client, StatusCode, Uri};
use tracing::debug;

use crate::manifest::HealthProbeSpec;

/// Evaluates every configured probe against `inspected`. An empty probe
/// list is vacuously healthy (a service with no declared health check is
/// considered healthy as soon as it is running).
pub async fn is_healthy(probes: &[HealthProbeSpec], inspected: &ContainerInspectResponse) -> bool {
    if probes.is_empty() {
        return true;
    }

    for probe in probes {
        if !http_probe_healthy(&probe.http, inspected).await {
            return false;
        }
    }
    true
}

async fn http_probe_healthy(
    probe: &crate::manifest::HttpProbeSpec,
    inspected: &ContainerInspectResponse,
) -> bool {
    let Some(host_port) = resolve_host_port(inspected, &probe.port) else {
        debug!(port = %probe.port, "health probe: no host port bound yet");
        return false;
    };

    let host = probe.ip.as_deref().unwrap_or("127.0.0.1");
    let path = &probe.path;
    let uri: Uri = match format!("{}://{host}:{host_port}{path}", probe.protocol).parse() {
        Ok(uri) => uri,
        Err(_) => return false,
    };

    let client = Client::new();
    match client.get(uri).await {
        // Exactly 200, not any 2xx: a probe path returning 204 or 202
        // means "accepted, not yet ready" under this daemon's contract.
        Ok(response) => response.status() == StatusCode::OK,
        Err(_) => false,
    }
}

/// Looks up the host-side port bound for `container_port` (e.g.
/// `"8080/tcp"`) in a container's inspect payload.
fn resolve_host_port(inspected: &ContainerInspectResponse, container_port: &str) -> Option<String> {
    let port_key = if container_port.contains('/') {
        container_port.to_string()
    } else {
        format!("{container_port}/tcp")
    };

    inspected
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&port_key)?
        .as_ref()?
        .first()?
        .host_port
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_probe_list_is_healthy() {
        let inspected = ContainerInspectResponse::default();
        assert!(is_healthy(&[], &inspected).await);
    }

    #[tokio::test]
    async fn missing_host_port_is_unhealthy() {
        let probes = vec![HealthProbeSpec {
            http: crate::manifest::HttpProbeSpec {
                port: "8080".into(),
                ip: None,
                path: "/".into(),
                protocol: "http".into(),
            },
        }];
        let inspected = ContainerInspectResponse::default();
        assert!(!is_healthy(&probes, &inspected).await);
    }
}
