//! Utilities for serving HTTPS.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use crate::commons::error::Error;


//------------ create_acceptor -----------------------------------------------

/// Creates the TLS acceptor from a PEM certificate chain and key.
pub fn create_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> Result<TlsAcceptor, Error> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_certs(cert_path)?, read_key(key_path)?)
        .map_err(|err| {
            Error::HttpsSetup(format!("unusable key or certificate: {err}"))
        })?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Reads all certificates from a PEM file.
///
/// The first certificate must be the server’s, followed by the chain.
fn read_certs(
    path: &Path
) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| file_error(path, err))?;
    if certs.is_empty() {
        return Err(Error::HttpsSetup(format!(
            "no certificates in {}", path.display()
        )))
    }
    Ok(certs)
}

/// Reads the first private key from a PEM file.
///
/// PKCS#1, PKCS#8 and SEC1 keys are accepted.
fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|err| file_error(path, err))?
        .ok_or_else(|| {
            Error::HttpsSetup(format!(
                "no private key in {}", path.display()
            ))
        })
}

fn open(path: &Path) -> Result<BufReader<File>, Error> {
    File::open(path).map(BufReader::new).map_err(|err| file_error(path, err))
}

fn file_error(path: &Path, err: io::Error) -> Error {
    Error::HttpsSetup(format!("cannot read {}: {}", path.display(), err))
}


//------------ Tests ---------------------------------------------------------
