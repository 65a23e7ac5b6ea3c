//! TLS and mutual-TLS acceptors from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

use super::{ServerListenConfig, TlsMode};
use crate::error::Error;

fn tls_err(path: &Path, msg: impl std::fmt::Display) -> Error {
    Error::Tls(format!("{}: {msg}", path.display()))
}

fn required<'a>(cfg: &'a ServerListenConfig, file: &'a Option<std::path::PathBuf>, what: &str) -> Result<&'a Path, Error> {
    file.as_deref().ok_or_else(|| Error::Tls(format!("{}: {what} is required", cfg.addr)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| tls_err(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(path, e))?;
    if certs.is_empty() {
        return Err(tls_err(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| tls_err(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_err(path, e))?
        .ok_or_else(|| tls_err(path, "no private key found"))
}

/// The acceptor for `cfg`, or `None` for plain HTTP. ALPN offers `h2` only
/// when the listener enables HTTP/2.
pub(crate) fn acceptor(cfg: &ServerListenConfig) -> Result<Option<TlsAcceptor>, Error> {
    if cfg.tls == TlsMode::Off {
        return Ok(None);
    }
    let certs = load_certs(required(cfg, &cfg.certfile, "certfile")?)?;
    let key = load_key(required(cfg, &cfg.keyfile, "keyfile")?)?;

    let builder = ServerConfig::builder();
    let builder = match cfg.tls {
        TlsMode::Mutual => {
            let trustfile = required(cfg, &cfg.trustfile, "trustfile")?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(trustfile)? {
                roots.add(cert).map_err(|e| tls_err(trustfile, e))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| tls_err(trustfile, e))?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("{}: {e}", cfg.addr)))?;
    config.alpn_protocols = match cfg.http2 {
        true => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        false => vec![b"http/1.1".to_vec()],
    };
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_listener_has_no_acceptor() {
        assert!(acceptor(&ServerListenConfig::new("127.0.0.1:0")).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_tls_errors() {
        let cfg = ServerListenConfig::tls("127.0.0.1:0", "/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(acceptor(&cfg), Err(Error::Tls(_))));

        let mut cfg = ServerListenConfig::new("127.0.0.1:0");
        cfg.tls = TlsMode::Tls;
        let err = acceptor(&cfg).err().unwrap();
        assert!(err.to_string().contains("certfile is required"));
    }
}
