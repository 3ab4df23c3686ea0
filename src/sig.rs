//! Firmware update signature verification.
//!
//! Signature keys are raw secp256r1 points: 64-byte files holding X||Y, each
//! coordinate 32 bytes big-endian, named `sig-<id>.key` in the station home
//! directory. A key is identified to the CUPS server by the CRC-32 of its
//! file contents. Updates are signed with ECDSA over a SHA-512 digest of the
//! firmware image; the digest is fed incrementally while the image streams to
//! disk.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::EncodedPoint;
use sha2::{Digest, Sha512};
use std::path::Path;

/// Maximum DER signature length accepted from CUPS.
pub const MAX_SIG_LEN: usize = 128;

/// CRC-32 identifying a key or credential file to the CUPS server.
pub fn file_crc(data: &[u8]) -> u32 {
    crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
}

/// One on-disk signature key.
#[derive(Debug, Clone)]
pub struct SigKey {
    /// CRC-32 of the raw key file.
    pub crc: u32,
    key: VerifyingKey,
}

impl SigKey {
    /// Parse a 64-byte X||Y key file.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() != 64 {
            return None;
        }

        let x = p256::FieldBytes::clone_from_slice(&raw[..32]);
        let y = p256::FieldBytes::clone_from_slice(&raw[32..]);

        let point = EncodedPoint::from_affine_coordinates(&x, &y, false);

        let key = VerifyingKey::from_encoded_point(&point).ok()?;

        Some(Self {
            crc: file_crc(raw),
            key,
        })
    }
}

/// Load every `sig-<id>.key` file in `home`, skipping unparseable ones with a
/// warning.
pub fn load_keys(home: &Path) -> Vec<SigKey> {
    let mut keys = Vec::new();

    let Ok(entries) = std::fs::read_dir(home) else {
        return keys;
    };

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("sig-") && n.ends_with(".key"))
                .unwrap_or(false)
        })
        .collect();

    paths.sort();

    for path in paths {
        match std::fs::read(&path) {
            Ok(raw) => match SigKey::from_raw(&raw) {
                Some(key) => {
                    log::debug!("loaded signature key {} (crc {:#010x})", path.display(), key.crc);

                    keys.push(key);
                }
                None => log::warn!("unusable signature key file {}", path.display()),
            },
            Err(e) => log::warn!("cannot read {}: {}", path.display(), e),
        }
    }

    keys
}

/// Streaming verifier for one firmware image.
#[derive(Debug)]
pub struct UpdateVerifier {
    digest: Sha512,
    /// CRC of the key the server claims to have signed with.
    pub keycrc: u32,
    signature: Vec<u8>,
}

/// What the verifier concluded about an update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A key verified the signature.
    Verified,
    /// Keys exist but none verified the signature: the update must not run.
    Rejected,
}

impl UpdateVerifier {
    /// Start verification with the signature segment's key CRC and DER bytes.
    pub fn new(keycrc: u32, signature: Vec<u8>) -> Self {
        Self {
            digest: Sha512::new(),
            keycrc,
            signature,
        }
    }

    /// Feed a chunk of the firmware image.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Finish the digest and try each key in turn.
    pub fn verify(self, keys: &[SigKey]) -> Verdict {
        let prehash = self.digest.finalize();

        let Ok(signature) = Signature::from_der(&self.signature) else {
            log::error!("update signature is not valid DER");

            return Verdict::Rejected;
        };

        for key in keys {
            if key.key.verify_prehash(prehash.as_slice(), &signature).is_ok() {
                if key.crc != self.keycrc {
                    log::info!(
                        "update verified by key crc {:#010x} (server claimed {:#010x})",
                        key.crc,
                        self.keycrc
                    );
                }

                return Verdict::Verified;
            }
        }

        Verdict::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;
    use pretty_assertions::assert_eq;

    fn keypair() -> (SigningKey, Vec<u8>) {
        let signing = SigningKey::random(&mut rand_core::OsRng);

        let point = signing.verifying_key().to_encoded_point(false);

        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(point.x().unwrap());
        raw.extend_from_slice(point.y().unwrap());

        (signing, raw)
    }

    fn sign(signing: &SigningKey, image: &[u8]) -> Vec<u8> {
        let digest = Sha512::digest(image);

        let sig: Signature = signing.sign_prehash(digest.as_slice()).unwrap();

        sig.to_der().as_bytes().to_vec()
    }

    #[test]
    fn raw_key_roundtrip() {
        let (_, raw) = keypair();

        let key = SigKey::from_raw(&raw).expect("valid key");

        assert_eq!(key.crc, file_crc(&raw));
        assert!(SigKey::from_raw(&raw[..63]).is_none());
    }

    #[test]
    fn streamed_image_verifies() {
        let (signing, raw) = keypair();
        let key = SigKey::from_raw(&raw).unwrap();

        let image = vec![0xabu8; 128 * 1024];
        let der = sign(&signing, &image);

        let mut verifier = UpdateVerifier::new(key.crc, der);

        // Feed the image in CUPS-chunk-sized pieces.
        for chunk in image.chunks(4096) {
            verifier.update(chunk);
        }

        assert_eq!(verifier.verify(&[key]), Verdict::Verified);
    }

    #[test]
    fn wrong_key_rejects() {
        let (signing, _) = keypair();
        let (_, other_raw) = keypair();
        let other = SigKey::from_raw(&other_raw).unwrap();

        let image = b"firmware".to_vec();
        let der = sign(&signing, &image);

        let mut verifier = UpdateVerifier::new(other.crc, der);
        verifier.update(&image);

        assert_eq!(verifier.verify(&[other]), Verdict::Rejected);
    }

    #[test]
    fn tampered_image_rejects() {
        let (signing, raw) = keypair();
        let key = SigKey::from_raw(&raw).unwrap();

        let image = b"firmware".to_vec();
        let der = sign(&signing, &image);

        let mut verifier = UpdateVerifier::new(key.crc, der);
        verifier.update(b"firmwarf");

        assert_eq!(verifier.verify(&[key]), Verdict::Rejected);
    }
}
