//! Request signers, run once per request before any I/O.

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use chunkflow_body::Request;
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, HeaderValue, InvalidHeaderValue};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Authorization scheme written by [`HmacSigner`].
pub const HMAC_SCHEME: &str = "CHUNKFLOW-HMAC-SHA256";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("random source failed: {0}")]
    Random(String),
}

/// Adds credentials to an outgoing request.
///
/// Signing may suspend (to refresh a token, say). A signer failure aborts
/// the request before a connection is checked out.
pub trait Signer: Send + Sync {
    fn sign(&self, request: Request) -> BoxFuture<'_, Result<Request, SignerError>>;
}

impl<F, Fut> Signer for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Request, SignerError>> + Send + 'static,
{
    fn sign(&self, request: Request) -> BoxFuture<'_, Result<Request, SignerError>> {
        Box::pin(self(request))
    }
}

/// Sends a fixed bearer token.
#[derive(Clone)]
pub struct BearerSigner {
    header: HeaderValue,
}

impl BearerSigner {
    pub fn new(token: &str) -> Result<Self, SignerError> {
        let mut header = HeaderValue::from_str(&format!("Bearer {token}"))?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

impl std::fmt::Debug for BearerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerSigner").finish_non_exhaustive()
    }
}

impl Signer for BearerSigner {
    fn sign(&self, mut request: Request) -> BoxFuture<'_, Result<Request, SignerError>> {
        request.headers_mut().insert(AUTHORIZATION, self.header.clone());
        Box::pin(async move { Ok(request) })
    }
}

/// Signs method, path, timestamp and a random nonce with a shared secret.
///
/// Written as
/// `Authorization: CHUNKFLOW-HMAC-SHA256 key=<id>,ts=<unix secs>,nonce=<hex>,sig=<hex>`.
pub struct HmacSigner {
    key_id: String,
    secret: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    /// Hex HMAC-SHA256 of the canonical string for one request.
    pub fn signature(
        &self,
        method: &str,
        path_and_query: &str,
        timestamp: u64,
        nonce: &str,
    ) -> Result<String, SignerError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SignerError::Credentials(e.to_string()))?;
        mac.update(format!("{method}\n{path_and_query}\n{timestamp}\n{nonce}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a header value produced by a signer holding the same secret.
    pub fn verify(&self, method: &str, path_and_query: &str, header: &str) -> bool {
        let Some(params) = header.strip_prefix(HMAC_SCHEME).map(str::trim_start) else {
            return false;
        };
        let (mut key, mut ts, mut nonce, mut sig) = (None, None, None, None);
        for pair in params.split(',') {
            match pair.split_once('=') {
                Some(("key", v)) => key = Some(v),
                Some(("ts", v)) => ts = v.parse::<u64>().ok(),
                Some(("nonce", v)) => nonce = Some(v),
                Some(("sig", v)) => sig = Some(v),
                _ => return false,
            }
        }
        let (Some(key), Some(ts), Some(nonce), Some(sig)) = (key, ts, nonce, sig) else {
            return false;
        };
        let Ok(sig) = hex::decode(sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(format!("{method}\n{path_and_query}\n{ts}\n{nonce}").as_bytes());
        key == self.key_id && mac.verify_slice(&sig).is_ok()
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, mut request: Request) -> BoxFuture<'_, Result<Request, SignerError>> {
        Box::pin(async move {
            let mut nonce = [0u8; 16];
            getrandom::getrandom(&mut nonce).map_err(|e| SignerError::Random(e.to_string()))?;
            let nonce = hex::encode(nonce);
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| SignerError::Credentials(format!("system clock: {e}")))?
                .as_secs();
            let target = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let sig = self.signature(request.method().as_str(), target, timestamp, &nonce)?;

            let mut header = HeaderValue::from_str(&format!(
                "{HMAC_SCHEME} key={},ts={timestamp},nonce={nonce},sig={sig}",
                self.key_id
            ))?;
            header.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, header);
            Ok(request)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    #[tokio::test]
    async fn bearer_sets_authorization() {
        let signer = BearerSigner::new("abc123").unwrap();
        let req = signer.sign(Request::get(Uri::from_static("/events"))).await.unwrap();
        let header = req.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(header, "Bearer abc123");
        assert!(header.is_sensitive());
    }

    #[test]
    fn bearer_rejects_header_breaking_tokens() {
        assert!(matches!(
            BearerSigner::new("bad\r\ntoken"),
            Err(SignerError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn hmac_signature_verifies() {
        let signer = HmacSigner::new("svc", b"s3cret".to_vec());
        let req = signer
            .sign(Request::get(Uri::from_static("/events?since=4")))
            .await
            .unwrap();
        let header = req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap().to_string();
        assert!(header.starts_with("CHUNKFLOW-HMAC-SHA256 key=svc,ts="));

        assert!(signer.verify("GET", "/events?since=4", &header));
        assert!(!signer.verify("POST", "/events?since=4", &header));
        assert!(!signer.verify("GET", "/events", &header));
        assert!(!HmacSigner::new("svc", b"other".to_vec()).verify("GET", "/events?since=4", &header));
    }

    #[tokio::test]
    async fn hmac_nonce_differs_per_request() {
        let signer = HmacSigner::new("svc", b"s3cret".to_vec());
        let a = signer.sign(Request::get(Uri::from_static("/"))).await.unwrap();
        let b = signer.sign(Request::get(Uri::from_static("/"))).await.unwrap();
        assert_ne!(a.headers().get(AUTHORIZATION), b.headers().get(AUTHORIZATION));
    }

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let signer = HmacSigner::new("svc", b"key".to_vec());
        let a = signer.signature("GET", "/x", 1_700_000_000, "00ff").unwrap();
        let b = signer.signature("GET", "/x", 1_700_000_000, "00ff").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, signer.signature("GET", "/x", 1_700_000_001, "00ff").unwrap());
    }

    #[tokio::test]
    async fn closures_are_signers() {
        let signer = |req: Request| async move {
            if req.uri().path() == "/forbidden" {
                Err(SignerError::Credentials("no token for path".into()))
            } else {
                Ok(req)
            }
        };
        assert!(signer.sign(Request::get(Uri::from_static("/ok"))).await.is_ok());
        assert!(signer.sign(Request::get(Uri::from_static("/forbidden"))).await.is_err());
    }
}
