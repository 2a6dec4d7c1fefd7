//! TLS material
//!
//! The operator hands over the certificate bundle and key as base64
//! encoded PEM. The server wants the leaf certificate, the rest of the
//! chain and the key as separate files.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::executor::{push_if_changed, FileSpec, FileStore};
use crate::pgconf::Settings;

/// Decoded and split TLS material, as PEM text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub leaf: String,
    /// Intermediate certificates, empty when the bundle has only the leaf
    pub chain: String,
    pub key: String,
}

/// Where the material is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub chain: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join("server.crt"),
            chain: dir.join("ca-chain.crt"),
            key: dir.join("server.key"),
        }
    }
}

fn decode_base64(what: &str, raw: &str) -> Result<Vec<u8>> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).map_err(|e| Error::Tls(format!("{} is not valid base64: {}", what, e)))
}

fn to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

impl TlsMaterial {
    /// Decode the base64 options and split the certificate bundle
    pub fn decode(ssl_cert: &str, ssl_key: &str) -> Result<Self> {
        let cert_pem = decode_base64("ssl_cert", ssl_cert)?;
        let key_pem = decode_base64("ssl_key", ssl_key)?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("failed to parse certificates: {}", e)))?;
        let (leaf, rest) = certs
            .split_first()
            .ok_or_else(|| Error::Tls("ssl_cert contains no certificate".to_string()))?;

        rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| Error::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::Tls("no private key found".to_string()))?;
        let key = String::from_utf8(key_pem)
            .map_err(|_| Error::Tls("ssl_key is not PEM text".to_string()))?;

        Ok(Self {
            leaf: to_pem(leaf.as_ref()),
            chain: rest.iter().map(|c| to_pem(c.as_ref())).collect(),
            key,
        })
    }

    /// Write the files owned by `user`. Returns whether any changed.
    pub async fn write(&self, files: &dyn FileStore, paths: &TlsPaths, user: &str) -> Result<bool> {
        let mut changed = push_if_changed(files, &paths.cert, &self.leaf, &FileSpec::owned_by(user, 0o644).make_dirs()).await?;
        if !self.chain.is_empty() {
            changed |= push_if_changed(files, &paths.chain, &self.chain, &FileSpec::owned_by(user, 0o640).make_dirs()).await?;
        }
        changed |= push_if_changed(files, &paths.key, &self.key, &FileSpec::owned_by(user, 0o600).make_dirs()).await?;
        Ok(changed)
    }

    /// Point the server at the written files
    pub fn apply(&self, settings: &mut Settings, paths: &TlsPaths) {
        settings.insert("ssl_cert_file", paths.cert.display().to_string());
        settings.insert("ssl_key_file", paths.key.display().to_string());
        if !self.chain.is_empty() {
            settings.insert("ssl_ca_file", paths.chain.display().to_string());
        }
    }
}
