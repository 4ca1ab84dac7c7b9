use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::{info, warn};
use wtransport::Identity;

use crate::config::ServerConfig;

// Dev certificate paths
const DEV_CERT_FILE: &str = "certs/cert.pem";
const DEV_KEY_FILE: &str = "certs/key.pem";

/// Names covered by the generated development certificate
const SELF_SIGNED_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// TLS configuration for the WebTransport listener
pub struct TlsConfig {
    /// The wtransport Identity containing certificate and key
    pub identity: Identity,
    /// Base64-encoded SHA-256 hash of the certificate (for browser flag)
    pub cert_hash: String,
}

impl TlsConfig {
    /// Load TLS configuration
    ///
    /// Production: TLS_CERT_PATH and TLS_KEY_PATH.
    /// Development: certs/ if present, otherwise a short-lived self-signed
    /// certificate generated at startup.
    pub async fn load(config: &ServerConfig) -> Result<Self> {
        if let (Some(cert_path), Some(key_path)) = (&config.tls_cert_path, &config.tls_key_path) {
            info!("Loading TLS certificate from {}", cert_path);
            return Self::load_from_paths(cert_path, key_path).await;
        }

        if Path::new(DEV_CERT_FILE).exists() && Path::new(DEV_KEY_FILE).exists() {
            info!("Loading dev certificate from certs/");
            return Self::load_from_paths(DEV_CERT_FILE, DEV_KEY_FILE).await;
        }

        warn!("No TLS certificate configured, generating a self-signed one");
        Self::self_signed()
    }

    /// Load certificate from PEM file paths
    async fn load_from_paths(cert_path: &str, key_path: &str) -> Result<Self> {
        let identity = Identity::load_pemfiles(cert_path, key_path)
            .await
            .context("Failed to load certificate from PEM files")?;
        Ok(Self::from_identity(identity))
    }

    /// Generate a self-signed certificate for local development
    pub fn self_signed() -> Result<Self> {
        let identity = Identity::self_signed(SELF_SIGNED_NAMES)
            .map_err(|e| anyhow!("Failed to generate self-signed certificate: {:?}", e))?;
        Ok(Self::from_identity(identity))
    }

    fn from_identity(identity: Identity) -> Self {
        let cert_hash = Self::compute_cert_hash(&identity);
        Self::log_cert_info(&cert_hash);
        Self {
            identity,
            cert_hash,
        }
    }

    fn compute_cert_hash(identity: &Identity) -> String {
        identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|cert| {
                let hash = digest(&SHA256, cert.der());
                STANDARD.encode(hash.as_ref())
            })
            .unwrap_or_default()
    }

    fn log_cert_info(cert_hash: &str) {
        info!("Certificate hash: {}", cert_hash);
        info!(
            "Chrome flag: --ignore-certificate-errors-spki-list={}",
            cert_hash
        );
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        &self.cert_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_hash_format() {
        let tls = TlsConfig::self_signed().unwrap();
        let decoded = STANDARD.decode(tls.cert_hash()).unwrap();
        // SHA-256 produces 32 bytes
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn test_missing_pem_files_error() {
        let config = ServerConfig {
            tls_cert_path: Some("does/not/exist.pem".into()),
            tls_key_path: Some("does/not/exist.key".into()),
            ..ServerConfig::default()
        };
        assert!(TlsConfig::load(&config).await.is_err());
    }
}
