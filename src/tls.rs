//! TLS contexts built from the credential store.
//!
//! The wire-level TLS machinery is a library concern; this module only turns
//! the DER files of a credential set into a `rustls` client configuration.
//! When a set carries no trust anchor the caller falls back to the TLS
//! library's platform roots (or plain TCP for `ws://`/`http://` URIs).

use crate::error::Error;
use crate::store::{self, Cat, CredSet, Elem, Store};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// Build a client TLS config from the given credential set.
///
/// Returns `None` when the set has no trust anchor, which means "use library
/// defaults". A present trust anchor plus a cert/key pair additionally enables
/// client authentication.
pub fn client_config(
    store: &mut Store,
    cat: Cat,
    set: CredSet,
) -> Result<Option<Arc<ClientConfig>>, Error> {
    let Some(trust) = store.read_elem(cat, set, Elem::Trust)? else {
        return Ok(None);
    };

    if trust.is_empty() {
        return Ok(None);
    }

    let mut roots = RootCertStore::empty();

    for der in der_certs(&trust) {
        roots
            .add(CertificateDer::from(der.to_vec()))
            .map_err(Error::Tls)?;
    }

    if roots.is_empty() {
        log::warn!("trust file of {:?}/{:?} holds no usable certificate", cat, set);

        return Ok(None);
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let cert = store.read_elem(cat, set, Elem::Cert)?.unwrap_or_default();
    let key = store.read_elem(cat, set, Elem::Key)?.unwrap_or_default();

    let config = if !cert.is_empty() && !key.is_empty() {
        let certs: Vec<CertificateDer<'static>> = der_certs(&cert)
            .into_iter()
            .map(|c| CertificateDer::from(c.to_vec()))
            .collect();

        let key = PrivateKeyDer::try_from(key).map_err(|e| {
            log::error!("client key of {:?}/{:?} unusable: {}", cat, set, e);

            Error::Internal
        })?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(Error::Tls)?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Some(Arc::new(config)))
}

/// Split a file holding one or more concatenated DER certificates.
fn der_certs(blob: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut rest = blob;

    while let Some((cert, tail)) = store::take_seq(rest) {
        out.push(cert);
        rest = tail;
    }

    if !rest.is_empty() {
        log::warn!("{} trailing bytes after DER certificates ignored", rest.len());
    }

    out
}
