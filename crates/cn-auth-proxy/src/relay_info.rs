//! NIP-11 pass-through that advertises NIP-42 on behalf of the upstream.

use anyhow::{bail, Context, Result};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

pub const NOSTR_JSON: &str = "application/nostr+json";
pub const NIP_AUTH: u64 = 42;

pub fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains(NOSTR_JSON))
        .unwrap_or(false)
}

pub async fn fetch_relay_info(client: &reqwest::Client, url: &str) -> Result<Value> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, NOSTR_JSON)
        .send()
        .await
        .with_context(|| format!("relay info request to {url} failed"))?
        .error_for_status()?;
    response
        .json::<Value>()
        .await
        .context("relay info is not valid json")
}

/// Appends 42 to `supported_nips`, creating the list when it is missing.
pub fn advertise_nip42(document: &mut Value) -> Result<()> {
    let Some(object) = document.as_object_mut() else {
        bail!("relay info is not a json object");
    };
    let nips = object
        .entry("supported_nips")
        .or_insert_with(|| json!([]));
    let Value::Array(nips) = nips else {
        bail!("supported_nips is not an array");
    };
    if !nips.iter().any(|nip| nip.as_u64() == Some(NIP_AUTH)) {
        nips.push(json!(NIP_AUTH));
    }
    Ok(())
}

pub async fn relay_info_response(client: &reqwest::Client, url: &str) -> Response {
    let document = fetch_relay_info(client, url).await.and_then(|mut document| {
        advertise_nip42(&mut document)?;
        Ok(document)
    });
    match document {
        Ok(document) => {
            let mut response = (StatusCode::OK, document.to_string()).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("*"),
            );
            response
        }
        Err(err) => {
            tracing::warn!(upstream = %url, error = %err, "relay info fetch failed");
            (StatusCode::BAD_GATEWAY, "upstream relay info unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_42_once() {
        let mut document = json!({"name": "relay", "supported_nips": [1, 11]});
        advertise_nip42(&mut document).unwrap();
        advertise_nip42(&mut document).unwrap();
        assert_eq!(document["supported_nips"], json!([1, 11, 42]));
    }

    #[test]
    fn creates_missing_list() {
        let mut document = json!({"name": "relay"});
        advertise_nip42(&mut document).unwrap();
        assert_eq!(document["supported_nips"], json!([42]));
    }

    #[test]
    fn rejects_unexpected_shapes() {
        assert!(advertise_nip42(&mut json!([1, 2])).is_err());
        assert!(advertise_nip42(&mut json!({"supported_nips": "1,11"})).is_err());
    }

    #[test]
    fn detects_nostr_accept_header() {
        let mut headers = HeaderMap::new();
        assert!(!wants_relay_info(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/nostr+json"));
        assert!(wants_relay_info(&headers));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_relay_info(&headers));
    }
}
