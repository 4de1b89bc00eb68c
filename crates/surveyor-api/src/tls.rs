//! TLS material for the metrics listener.
//!
//! Loads a PEM certificate chain and private key into a `rustls` server
//! config. With a client CA, clients must present a certificate it signed.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::info;

/// Build a server config from PEM files.
pub fn load_server_config(
    cert_file: &Path,
    key_file: &Path,
    ca_file: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?;

    let config = match ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .with_context(|| format!("invalid CA certificate in {}", ca_file.display()))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .context("client certificate verifier")?;
            info!(ca = %ca_file.display(), "client certificates required");
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .context("server certificate does not match key")?;

    info!(cert = %cert_file.display(), "loaded TLS certificate");
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse private key in {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Material {
        dir: PathBuf,
    }

    impl Material {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("surveyor-tls-{tag}-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();

            let key = rcgen::KeyPair::generate().unwrap();
            let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
                .unwrap()
                .self_signed(&key)
                .unwrap();
            std::fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
            std::fs::write(dir.join("key.pem"), key.serialize_pem()).unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.join(name)
        }
    }

    impl Drop for Material {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn loads_cert_and_key() {
        let m = Material::new("plain");
        let config = load_server_config(&m.path("cert.pem"), &m.path("key.pem"), None);
        assert!(config.is_ok());
    }

    #[test]
    fn loads_with_client_ca() {
        let m = Material::new("mutual");
        // The self-signed server cert doubles as the client CA.
        let config = load_server_config(
            &m.path("cert.pem"),
            &m.path("key.pem"),
            Some(&m.path("cert.pem")),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        let m = Material::new("missing");
        let err = load_server_config(&m.path("nope.pem"), &m.path("key.pem"), None).unwrap_err();
        assert!(format!("{err:#}").contains("nope.pem"));
    }

    #[test]
    fn key_file_without_key_is_an_error() {
        let m = Material::new("swapped");
        let err =
            load_server_config(&m.path("cert.pem"), &m.path("cert.pem"), None).unwrap_err();
        assert!(format!("{err:#}").contains("no private key"));
    }
}
