use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Signature service rate limited the request")]
    RateLimited,

    #[error("Signature not found")]
    NotFound,

    #[error("Signature service request failed: {0}")]
    Http(String),

    #[error("Failed to decode signature service response: {0}")]
    Decode(String),
}

/// Remote signature resolution: topic hash to canonical text signature,
/// e.g. `Transfer(address,address,uint256)`.
#[async_trait]
pub trait SignatureLookup: Send + Sync {
    async fn lookup(&self, hex_signature: &str) -> Result<String, LookupError>;

    /// Value recorded in `signature_cache.source` for resolutions made here.
    fn source(&self) -> &str;
}

pub const FOURBYTE_SOURCE: &str = "4byte.directory";

#[derive(Debug, Deserialize)]
struct FourByteResponse {
    #[serde(default)]
    results: Vec<FourByteSignature>,
}

#[derive(Debug, Deserialize)]
struct FourByteSignature {
    text_signature: String,
}

/// Client for the 4byte.directory event-signature API.
#[derive(Debug, Clone)]
pub struct FourByteClient {
    http: reqwest::Client,
    api_url: String,
}

impl FourByteClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration, user_agent: &str) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| LookupError::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.into(),
        })
    }
}

/// `0x`-prefixed, lowercase form the service indexes by.
pub fn normalize_signature(signature: &str) -> String {
    let hex = signature
        .strip_prefix("0x")
        .or_else(|| signature.strip_prefix("0X"))
        .unwrap_or(signature);
    format!("0x{}", hex.to_ascii_lowercase())
}

#[async_trait]
impl SignatureLookup for FourByteClient {
    async fn lookup(&self, hex_signature: &str) -> Result<String, LookupError> {
        let hex_signature = normalize_signature(hex_signature);
        let response = self
            .http
            .get(&self.api_url)
            .query(&[("hex_signature", hex_signature.as_str())])
            .send()
            .await
            .map_err(|e| LookupError::Http(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::TOO_MANY_REQUESTS => return Err(LookupError::RateLimited),
            reqwest::StatusCode::NOT_FOUND => return Err(LookupError::NotFound),
            status if !status.is_success() => {
                return Err(LookupError::Http(format!("HTTP {}", status)));
            }
            _ => {}
        }

        let body: FourByteResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Decode(e.to_string()))?;

        body.results
            .into_iter()
            .next()
            .map(|r| r.text_signature)
            .ok_or(LookupError::NotFound)
    }

    fn source(&self) -> &str {
        FOURBYTE_SOURCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_signature() {
        assert_eq!(normalize_signature("0xDDF252AD"), "0xddf252ad");
        assert_eq!(normalize_signature("ddf252ad"), "0xddf252ad");
    }

    #[test]
    fn test_response_takes_first_result() {
        let body: FourByteResponse = serde_json::from_str(
            r#"{"count": 2, "next": null, "results": [
                {"id": 1, "text_signature": "Transfer(address,address,uint256)", "hex_signature": "0xddf2"},
                {"id": 2, "text_signature": "Other()", "hex_signature": "0xddf2"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(body.results[0].text_signature, "Transfer(address,address,uint256)");

        let empty: FourByteResponse = serde_json::from_str(r#"{"count": 0, "results": []}"#).unwrap();
        assert!(empty.results.is_empty());
    }

    #[test]
    fn test_client_builds() {
        let client = FourByteClient::new(
            "https://www.4byte.directory/api/v1/event-signatures/",
            Duration::from_secs(5),
            "block-range-indexer/0.1",
        )
        .unwrap();
        assert_eq!(client.source(), FOURBYTE_SOURCE);
    }
}
