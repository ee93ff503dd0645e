//! Server TLS material loading.
//!
//! Certificate acquisition and renewal live outside the relay; this module
//! only turns the PEM files the external tooling maintains into a rustls
//! server configuration with a TLS 1.2 floor.

use std::{fs::File, io::BufReader, path::Path};

use anyhow::Context;
use tokio_rustls::rustls::{self, ServerConfig};

/// # Errors
///
/// Returns an error if the files cannot be read or contain no usable
/// certificate chain and private key.
pub fn server_config(cert_file: &Path, key_file: &Path) -> anyhow::Result<ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_file)
            .with_context(|| format!("failed to open certificate file {}", cert_file.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read certificates from {}", cert_file.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_file.display());
    }

    let mut key_reader = BufReader::new(
        File::open(key_file)
            .with_context(|| format!("failed to open key file {}", key_file.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("failed to read private key from {}", key_file.display()))?
        .with_context(|| format!("no private key found in {}", key_file.display()))?;

    ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("failed to build TLS server configuration")
}
