//! Remote key resolver: fetches a validation key's JWK bytes from an HTTP
//! key-service on a cache miss.

use std::time::Duration;

use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid key-resolver base URL")]
    BadBaseUrl(#[source] url::ParseError),
    #[error("couldn't build HTTP client")]
    BuildClient(#[source] reqwest::Error),
    #[error("request to key resolver failed")]
    Http(#[source] reqwest::Error),
    #[error("key resolver returned status {status}")]
    Status { status: reqwest::StatusCode },
    #[error("couldn't read key resolver response body")]
    Body(#[source] reqwest::Error),
}

/// Fetches a JWK document for a given `kid` from `GET {base}/node/{kid}/public_key`.
///
/// Cheap to clone: `reqwest::Client` is internally `Arc`-backed, so every
/// upbridge can hold its own clone of the orchestrator's single resolver.
#[derive(Clone)]
pub struct Resolver {
    base_url: Url,
    client: reqwest::Client,
}

impl Resolver {
    pub fn new(base_url: &str) -> Result<Self, ResolverError> {
        let base_url = Url::parse(base_url).map_err(ResolverError::BadBaseUrl)?;

        let client = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_3)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ResolverError::BuildClient)?;

        Ok(Self { base_url, client })
    }

    /// `GET {base}/node/{kid}/public_key`, returning the response body verbatim
    /// on a 200; the body is expected to be a JWK ready for
    /// `bridge_keys::parse_validation`.
    pub async fn fetch(&self, kid: &str) -> Result<Vec<u8>, ResolverError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ResolverError::BadBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase)
            })?;
            segments.push("node").push(kid).push("public_key");
        }

        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(ResolverError::Http)?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ResolverError::Status { status: response.status() });
        }

        response.bytes().await.map(|bytes| bytes.to_vec()).map_err(ResolverError::Body)
    }
}

#[cfg(test)]
mod test {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn fetch_builds_expected_path_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/node/k1/public_key"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(br#"{"kty":"OKP"}"#.to_vec(), "application/json"))
            .mount(&server)
            .await;

        let resolver = Resolver::new(&server.uri()).unwrap();
        let body = resolver.fetch("k1").await.unwrap();

        assert_eq!(body, br#"{"kty":"OKP"}"#);
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/node/missing/public_key")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let resolver = Resolver::new(&server.uri()).unwrap();
        assert!(matches!(resolver.fetch("missing").await, Err(ResolverError::Status { status }) if status == 404));
    }
}
