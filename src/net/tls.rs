//! TLS configuration and certificate provisioning.

use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Only one of certificate {cert:?} and key {key:?} exists; refusing to overwrite it")]
    Partial { cert: PathBuf, key: PathBuf },

    #[error("Invalid TLS material in {path:?}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("Failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS configuration: {0}")]
    Load(#[source] io::Error),

    #[error("Certificate provisioning task failed: {0}")]
    Task(String),
}

/// What a provisioner did to make the certificate pair available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Both files were already present and parse.
    Existing,
    /// A fresh pair was written.
    Generated,
}

/// Guarantees a usable certificate/key pair exists at the given paths.
///
/// Called from the blocking pool, so implementations may do file IO and
/// key generation synchronously.
pub trait CertificateProvisioner: Send + Sync + 'static {
    fn provision(&self, cert_path: &Path, key_path: &Path) -> Result<Provisioned, CertError>;
}

/// Uses existing PEM files, or generates a self-signed pair if both are absent.
#[derive(Debug, Clone)]
pub struct SelfSignedProvisioner {
    subject_alt_names: Vec<String>,
}

impl SelfSignedProvisioner {
    pub fn new(subject_alt_names: Vec<String>) -> Self {
        Self { subject_alt_names }
    }

    /// Defaults plus `host`, unless it is a wildcard bind address.
    pub fn for_host(host: &str) -> Self {
        let mut provisioner = Self::default();
        let wildcard = matches!(host, "" | "0.0.0.0" | "::" | "[::]");
        if !wildcard && !provisioner.subject_alt_names.iter().any(|n| n == host) {
            provisioner.subject_alt_names.push(host.to_string());
        }
        provisioner
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }
}

impl Default for SelfSignedProvisioner {
    fn default() -> Self {
        Self::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
    }
}

impl CertificateProvisioner for SelfSignedProvisioner {
    fn provision(&self, cert_path: &Path, key_path: &Path) -> Result<Provisioned, CertError> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                check_pem_pair(cert_path, key_path)?;
                Ok(Provisioned::Existing)
            }
            (false, false) => {
                generate_self_signed(&self.subject_alt_names, cert_path, key_path)?;
                Ok(Provisioned::Generated)
            }
            _ => Err(CertError::Partial {
                cert: cert_path.to_path_buf(),
                key: key_path.to_path_buf(),
            }),
        }
    }
}

fn generate_self_signed(names: &[String], cert_path: &Path, key_path: &Path) -> Result<(), CertError> {
    tracing::info!(cert = ?cert_path, key = ?key_path, "Certificate files missing, generating self-signed pair");

    let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(names.to_vec())?;

    write_pem(cert_path, cert.pem().as_bytes(), 0o644)?;
    write_pem(key_path, signing_key.serialize_pem().as_bytes(), 0o600)?;

    tracing::info!(cert = ?cert_path, "Self-signed certificate created");
    Ok(())
}

fn write_pem(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertError> {
    let io_error = |source| CertError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // final mode from creation on
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_error)?;
    }

    Ok(())
}

/// Make sure the certificate file holds at least one certificate and the
/// key file holds a private key.
fn check_pem_pair(cert_path: &Path, key_path: &Path) -> Result<(), CertError> {
    let open = |path: &Path| {
        fs::File::open(path)
            .map(BufReader::new)
            .map_err(|source| CertError::Io {
                path: path.to_path_buf(),
                source,
            })
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Invalid {
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CertError::Invalid {
            path: cert_path.to_path_buf(),
            reason: "no certificate found".to_string(),
        });
    }

    match rustls_pemfile::private_key(&mut open(key_path)?) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(CertError::Invalid {
            path: key_path.to_path_buf(),
            reason: "no private key found".to_string(),
        }),
        Err(e) => Err(CertError::Invalid {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Install the process-wide rustls crypto provider. Later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, CertError> {
    // Basic validation
    if !cert_path.exists() {
        return Err(CertError::Load(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        )));
    }
    if !key_path.exists() {
        return Err(CertError::Load(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        )));
    }

    RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(CertError::Load)
}
