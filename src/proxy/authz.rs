//! Session authorization decoding and the TLS identity derived from it.
//!
//! A session authorization travels as base58 text over a length-delimited
//! binary envelope. It carries everything the proxy needs to reach a worker:
//! the worker addresses, a client certificate chain with its key, and the
//! session's limits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use x509_cert::der::Decode;

use crate::errors::{Error, Result};

/// Length of the TOFU token presented to the worker to pin the session's
/// client identity on first connection.
pub const TOFU_TOKEN_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub address: String,
}

/// The decoded authorization for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAuthorization {
    pub session_id: String,
    pub created_time: DateTime<Utc>,
    /// As issued; the proxy trusts the client certificate's validity end,
    /// which equals this by construction.
    pub expiration: DateTime<Utc>,
    pub connection_limit: i64,
    pub default_client_port: u16,
    /// Ordered by preference; never empty.
    pub workers: Vec<WorkerInfo>,
    /// DER certificates, leaf first.
    pub certificate_chain: Vec<Vec<u8>>,
    /// PKCS#8 DER private key for the leaf.
    pub private_key: Vec<u8>,
}

impl SessionAuthorization {
    /// Decode the compact printable form produced by [`Self::encode`].
    pub fn decode(blob: &str) -> Result<Self> {
        const OP: &str = "authz.decode";
        let bytes = bs58::decode(blob)
            .into_vec()
            .map_err(|e| Error::encoding(OP, format!("base58 decode: {e}")))?;
        if bytes.is_empty() {
            return Err(Error::invalid_parameter(OP, "zero-length authorization data after decoding"));
        }
        let authz: SessionAuthorization =
            postcard::from_bytes(&bytes).map_err(|e| Error::encoding(OP, format!("envelope decode: {e}")))?;
        if authz.workers.is_empty() {
            return Err(Error::invalid_parameter(OP, "no workers found in authorization data"));
        }
        if authz.certificate_chain.is_empty() {
            return Err(Error::invalid_parameter(OP, "no certificates found in authorization data"));
        }
        if authz.session_id.is_empty() {
            return Err(Error::invalid_parameter(OP, "missing session id in authorization data"));
        }
        Ok(authz)
    }

    /// Encode to the compact printable wire form.
    pub fn encode(&self) -> Result<String> {
        const OP: &str = "authz.encode";
        let bytes = postcard::to_stdvec(self).map_err(|e| Error::encoding(OP, e))?;
        Ok(bs58::encode(bytes).into_string())
    }

    /// The validity end of the leaf certificate, which is the session's
    /// expiration.
    pub fn certificate_expiration(&self) -> Result<DateTime<Utc>> {
        const OP: &str = "authz.certificate_expiration";
        let leaf = self
            .certificate_chain
            .first()
            .ok_or_else(|| Error::invalid_parameter(OP, "certificate chain is empty"))?;
        let cert = x509_cert::Certificate::from_der(leaf)
            .map_err(|e| Error::encoding(OP, format!("parsing leaf certificate: {e}")))?;
        let not_after = cert.tbs_certificate.validity.not_after.to_unix_duration();
        DateTime::from_timestamp_millis(not_after.as_millis() as i64)
            .ok_or_else(|| Error::internal(OP, "certificate validity end out of range"))
    }

    /// Build the TLS client configuration for worker connections: the
    /// session chain acts as both trust root and client identity.
    pub fn client_tls_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        const OP: &str = "authz.client_tls_config";
        let chain: Vec<CertificateDer<'static>> = self
            .certificate_chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();

        let mut roots = rustls::RootCertStore::empty();
        for cert in &chain {
            roots
                .add(cert.clone())
                .map_err(|e| Error::encoding(OP, format!("adding session certificate to roots: {e}")))?;
        }

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.clone()));
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal(OP, format!("selecting protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::encoding(OP, format!("building client identity: {e}")))?;
        Ok(Arc::new(config))
    }
}

/// Generate a fresh random TOFU token.
pub fn new_tofu_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOFU_TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_authz() -> SessionAuthorization {
        let now = Utc::now();
        SessionAuthorization {
            session_id: "s_1234567890".to_string(),
            created_time: now,
            expiration: now + Duration::hours(8),
            connection_limit: 4,
            default_client_port: 0,
            workers: vec![WorkerInfo { address: "localhost:9202".to_string() }],
            certificate_chain: vec![vec![1, 2, 3]],
            private_key: vec![4, 5, 6],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let authz = sample_authz();
        let blob = authz.encode().unwrap();
        // The printable form stays in the base58 alphabet.
        assert!(!blob.contains('0'));
        assert!(!blob.contains('O'));
        let decoded = SessionAuthorization::decode(&blob).unwrap();
        assert_eq!(authz, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(SessionAuthorization::decode("not-base58-0OIl").is_err());
        assert!(SessionAuthorization::decode("").is_err());
        // Valid base58 but not a valid envelope.
        assert!(SessionAuthorization::decode("3mJr7AoUXx2Wqd").is_err());
    }

    #[test]
    fn decode_rejects_empty_worker_list() {
        let mut authz = sample_authz();
        authz.workers.clear();
        let blob = authz.encode().unwrap();
        let err = SessionAuthorization::decode(&blob).unwrap_err();
        assert!(err.to_string().contains("no workers"));
    }

    #[test]
    fn tofu_tokens_are_random_and_sized() {
        let a = new_tofu_token();
        let b = new_tofu_token();
        assert_eq!(a.len(), TOFU_TOKEN_LEN);
        assert_eq!(b.len(), TOFU_TOKEN_LEN);
        assert_ne!(a, b);
    }
}
