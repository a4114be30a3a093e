//! Forwarding of decoded Request frames to the local backend.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method};
use tracing::warn;

use porthole_shared::protocol::{RequestFrame, ResponseFrame};
use porthole_shared::TunnelError;

/// HTTP client for the local backend. Redirects are not followed — a 3xx
/// from the backend is surfaced to the original caller as-is.
pub fn backend_client() -> anyhow::Result<Client> {
    Ok(Client::builder().redirect(redirect::Policy::none()).build()?)
}

/// Replay one Request frame against the local backend and build the Response
/// frame carrying the same id. Every failure becomes a 502 frame, so the
/// relay's pending entry is always resolved.
pub async fn dispatch(client: &Client, base_target_url: &str, frame: RequestFrame) -> ResponseFrame {
    let id = frame.id;
    match call_backend(client, base_target_url, frame).await {
        Ok(response) => response,
        Err(err) => {
            warn!("Backend call for request {} failed: {}", id, err);
            bad_gateway(id, &err)
        }
    }
}

async fn call_backend(
    client: &Client,
    base_target_url: &str,
    frame: RequestFrame,
) -> Result<ResponseFrame, TunnelError> {
    let method = Method::from_bytes(frame.method.as_bytes())
        .map_err(|_| TunnelError::Backend(format!("invalid method {:?}", frame.method)))?;
    let url = join_target_url(base_target_url, &frame.url);

    let response = client
        .request(method, &url)
        .headers(to_header_map(&frame.headers))
        .body(frame.body)
        .send()
        .await
        .map_err(|e| TunnelError::Backend(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = from_header_map(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|e| TunnelError::Backend(e.to_string()))?
        .to_vec();

    Ok(ResponseFrame {
        id: frame.id,
        status,
        headers,
        body,
    })
}

fn bad_gateway(id: u64, err: &TunnelError) -> ResponseFrame {
    ResponseFrame {
        id,
        status: 502,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: err.to_string().into_bytes(),
    }
}

/// The frame's url carries the full path and query, so the target is a
/// plain concatenation onto the base.
fn join_target_url(base: &str, url: &str) -> String {
    format!("{}{}", base, url)
}

/// Entries that do not form valid header names or values are skipped.
fn to_header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn from_header_map(map: &HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|val| (k.as_str().to_string(), val.to_string()))
        })
        .collect()
}
