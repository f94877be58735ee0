//! TLS support for STARTTLS

use anyhow::{anyhow, Result};
use cormorant_common::config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load TLS configuration and create an acceptor
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    // Load certificates
    let cert_file = File::open(&tls_config.cert_path)
        .map_err(|e| anyhow!("Failed to open certificate file: {}", e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    info!("Loaded {} certificate(s)", certs.len());

    // Load private key
    let key_file = File::open(&tls_config.key_path)
        .map_err(|e| anyhow!("Failed to open key file: {}", e))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow!("Failed to read private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    build_acceptor(certs, key)
}

/// Create an acceptor from certificate chain and key already in memory
pub fn build_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cormorant-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_acceptor_from_pem_files() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = TlsConfig {
            cert_path: write_temp("cert.pem", &cert.cert.pem()),
            key_path: write_temp("key.pem", &cert.key_pair.serialize_pem()),
        };

        assert!(create_tls_acceptor(&config).is_ok());

        let _ = std::fs::remove_file(&config.cert_path);
        let _ = std::fs::remove_file(&config.key_path);
    }

    #[test]
    fn test_missing_files() {
        let config = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("certificate file"));
    }

    #[test]
    fn test_empty_certificate_file() {
        let config = TlsConfig {
            cert_path: write_temp("empty.pem", ""),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("No certificates"));
        let _ = std::fs::remove_file(&config.cert_path);
    }
}
