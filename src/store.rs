//! Transactional on-disk credential store.
//!
//! Per category (`tc`, `cups`) the store holds four element files
//! `{trust, cert, key, uri}` in four sets: the active `reg` set, a `bak`
//! fallback, the factory `boot` set and a `temp` staging area. Replacement of
//! the active set is transactional: a marker file is created before any
//! rename, directory fsyncs order the steps, and startup recovery drives any
//! half-done operation forward. A crash at any point leaves the store
//! indistinguishable from one where the operation completed.

use crate::error::StoreError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Credential category.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Cat {
    /// LNS transport credentials.
    Tc,
    /// CUPS credentials.
    Cups,
}

impl Cat {
    /// All categories, recovery order.
    pub const ALL: [Cat; 2] = [Cat::Cups, Cat::Tc];

    fn prefix(self) -> &'static str {
        match self {
            Cat::Tc => "tc",
            Cat::Cups => "cups",
        }
    }
}

/// Credential set within a category.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CredSet {
    /// The active set.
    Reg,
    /// Backup of the last known-good set.
    Bak,
    /// Factory fallback.
    Boot,
    /// Staging area for a pending update.
    Temp,
}

impl CredSet {
    fn infix(self) -> &'static str {
        match self {
            CredSet::Reg => "",
            CredSet::Bak => "-bak",
            CredSet::Boot => "-boot",
            CredSet::Temp => "-temp",
        }
    }

    /// Rotation used by CUPS when a set keeps failing: REG → BAK → BOOT → REG.
    pub fn rotate(self) -> CredSet {
        match self {
            CredSet::Reg => CredSet::Bak,
            CredSet::Bak => CredSet::Boot,
            CredSet::Boot => CredSet::Reg,
            CredSet::Temp => CredSet::Reg,
        }
    }
}

/// Element file within a set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Elem {
    /// CA certificate(s), DER.
    Trust,
    /// Client certificate, DER. May be empty.
    Cert,
    /// Client key, DER or an opaque token. May be empty.
    Key,
    /// Server URI.
    Uri,
}

impl Elem {
    /// All element kinds.
    pub const ALL: [Elem; 4] = [Elem::Trust, Elem::Cert, Elem::Key, Elem::Uri];

    fn ext(self) -> &'static str {
        match self {
            Elem::Trust => "trust",
            Elem::Cert => "cert",
            Elem::Key => "key",
            Elem::Uri => "uri",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Marker {
    Upd,
    Cpy,
    Done,
}

impl Marker {
    fn ext(self) -> &'static str {
        match self {
            Marker::Upd => "upd",
            Marker::Cpy => "cpy",
            Marker::Done => "done",
        }
    }
}

/// The credential store rooted at the station home directory.
#[derive(Debug)]
pub struct Store {
    home: PathBuf,
    uri_cache: HashMap<(Cat, CredSet), Option<String>>,
}

impl Store {
    /// Open the store. No I/O happens until an operation needs it; call
    /// [`Store::recover`] before anything else at startup.
    pub fn new(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            uri_cache: HashMap::new(),
        }
    }

    /// Station home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    fn elem_path(&self, cat: Cat, set: CredSet, elem: Elem) -> PathBuf {
        self.home
            .join(format!("{}{}.{}", cat.prefix(), set.infix(), elem.ext()))
    }

    fn marker_path(&self, cat: Cat, marker: Marker) -> PathBuf {
        self.home.join(format!("{}.{}", cat.prefix(), marker.ext()))
    }

    fn fsync_dir(&self) -> Result<(), StoreError> {
        fs::File::open(&self.home)?.sync_all()?;

        Ok(())
    }

    fn touch(&self, path: &Path) -> Result<(), StoreError> {
        fs::File::create(path)?.sync_all()?;

        Ok(())
    }

    fn remove_if_present(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage an element into the temp set. Empty data writes an empty file so
    /// backup sets stay uniform.
    pub fn write_temp(&mut self, cat: Cat, elem: Elem, data: &[u8]) -> Result<(), StoreError> {
        fs::write(self.elem_path(cat, CredSet::Temp, elem), data)?;

        self.uri_cache.remove(&(cat, CredSet::Temp));

        Ok(())
    }

    /// Whether any temp element is staged for `cat`.
    pub fn has_pending(&self, cat: Cat) -> bool {
        Elem::ALL
            .iter()
            .any(|e| self.elem_path(cat, CredSet::Temp, *e).is_file())
    }

    /// Atomically promote the temp set to the active set.
    ///
    /// Protocol: create the `upd` marker, fsync, rename every staged element,
    /// fsync, delete the marker. Recovery replays from the renames if the
    /// marker survives a crash.
    pub fn commit(&mut self, cat: Cat) -> Result<(), StoreError> {
        self.touch(&self.marker_path(cat, Marker::Upd))?;
        self.fsync_dir()?;

        self.commit_renames(cat)?;

        self.fsync_dir()?;
        self.remove_if_present(&self.marker_path(cat, Marker::Upd))?;

        // The active set changed; the existing backup no longer reflects a
        // known-good current configuration.
        self.remove_if_present(&self.marker_path(cat, Marker::Done))?;

        log::info!("{}: committed configuration update", cat.prefix());

        Ok(())
    }

    fn commit_renames(&mut self, cat: Cat) -> Result<(), StoreError> {
        for elem in Elem::ALL {
            let temp = self.elem_path(cat, CredSet::Temp, elem);

            if temp.is_file() {
                fs::rename(&temp, self.elem_path(cat, CredSet::Reg, elem))?;
            }
        }

        self.uri_cache.remove(&(cat, CredSet::Reg));
        self.uri_cache.remove(&(cat, CredSet::Temp));

        Ok(())
    }

    /// Copy the active set to the backup set.
    ///
    /// Called when TC connects successfully with REG credentials, so BAK
    /// always holds a set that once worked. A surviving `done` marker means
    /// the backup is already current and the call is a no-op.
    pub fn backup(&mut self, cat: Cat) -> Result<(), StoreError> {
        if self.marker_path(cat, Marker::Done).is_file() {
            log::debug!("{}: backup already current", cat.prefix());

            return Ok(());
        }

        self.touch(&self.marker_path(cat, Marker::Cpy))?;
        self.fsync_dir()?;

        self.backup_copies(cat)?;

        self.touch(&self.marker_path(cat, Marker::Done))?;
        self.fsync_dir()?;
        self.remove_if_present(&self.marker_path(cat, Marker::Cpy))?;

        log::info!("{}: credentials backed up", cat.prefix());

        Ok(())
    }

    fn backup_copies(&mut self, cat: Cat) -> Result<(), StoreError> {
        self.remove_if_present(&self.marker_path(cat, Marker::Done))?;

        for elem in Elem::ALL {
            self.remove_if_present(&self.elem_path(cat, CredSet::Bak, elem))?;
        }

        for elem in Elem::ALL {
            let reg = self.elem_path(cat, CredSet::Reg, elem);

            if reg.is_file() {
                fs::copy(&reg, self.elem_path(cat, CredSet::Bak, elem))?;
            }
        }

        self.uri_cache.remove(&(cat, CredSet::Bak));

        Ok(())
    }

    /// Drive any half-done transaction to completion.
    ///
    /// Must run before normal operation; failure here is process-fatal since
    /// the store contents cannot be trusted.
    pub fn recover(&mut self) -> Result<(), StoreError> {
        for cat in Cat::ALL {
            if self.marker_path(cat, Marker::Upd).is_file() {
                log::warn!("{}: recovering interrupted commit", cat.prefix());

                self.commit_renames(cat)?;
                self.fsync_dir()?;
                self.remove_if_present(&self.marker_path(cat, Marker::Upd))?;
                self.remove_if_present(&self.marker_path(cat, Marker::Done))?;
            }

            if self.marker_path(cat, Marker::Cpy).is_file() {
                log::warn!("{}: recovering interrupted backup", cat.prefix());

                self.backup_copies(cat)?;
                self.touch(&self.marker_path(cat, Marker::Done))?;
                self.fsync_dir()?;
                self.remove_if_present(&self.marker_path(cat, Marker::Cpy))?;
            }
        }

        Ok(())
    }

    /// Abort a pending update: drop all `upd` markers and temp files, leaving
    /// everything else alone.
    pub fn reset_update(&mut self, cat: Cat) -> Result<(), StoreError> {
        self.remove_if_present(&self.marker_path(cat, Marker::Upd))?;

        for elem in Elem::ALL {
            self.remove_if_present(&self.elem_path(cat, CredSet::Temp, elem))?;
        }

        self.uri_cache.remove(&(cat, CredSet::Temp));

        Ok(())
    }

    /// Read-through URI lookup with trailing whitespace trimmed.
    pub fn uri(&mut self, cat: Cat, set: CredSet) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.uri_cache.get(&(cat, set)) {
            return Ok(cached.clone());
        }

        let path = self.elem_path(cat, set, Elem::Uri);

        let value = match fs::read(&path) {
            Ok(raw) => {
                if raw.len() > crate::MAX_URI_LEN {
                    return Err(StoreError::UriTooLong { len: raw.len() });
                }

                let s = String::from_utf8_lossy(&raw).trim_end().to_string();

                if s.is_empty() {
                    None
                } else {
                    Some(s)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        self.uri_cache.insert((cat, set), value.clone());

        Ok(value)
    }

    /// Read one element file; `None` if absent.
    pub fn read_elem(&self, cat: Cat, set: CredSet, elem: Elem) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.elem_path(cat, set, elem)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// CRC-32 over the concatenated `trust`, `cert` and `key` files of a set,
    /// `0` when the set holds no credentials at all. Reported to CUPS so the
    /// server can skip unchanged segments.
    pub fn cred_crc(&self, cat: Cat, set: CredSet) -> Result<u32, StoreError> {
        let mut any = false;
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = crc.digest();

        for elem in [Elem::Trust, Elem::Cert, Elem::Key] {
            if let Some(data) = self.read_elem(cat, set, elem)? {
                any = true;
                digest.update(&data);
            }
        }

        Ok(if any { digest.finalize() } else { 0 })
    }
}

/// Split an opaque CUPS credential blob into `(trust, cert, key)`.
///
/// The blob is a concatenation of an ASN.1 SEQUENCE (trust), an optional
/// SEQUENCE (cert) and a key that is either a SEQUENCE or an opaque token.
pub fn split_cred_blob(blob: &[u8]) -> Result<(&[u8], &[u8], &[u8]), StoreError> {
    let (trust, rest) = take_seq(blob).ok_or(StoreError::Asn1)?;

    if rest.is_empty() {
        return Ok((trust, &[], &[]));
    }

    match take_seq(rest) {
        Some((cert, rest2)) => {
            if rest2.is_empty() {
                Ok((trust, cert, &[]))
            } else {
                match take_seq(rest2) {
                    Some((key, rest3)) if rest3.is_empty() => Ok((trust, cert, key)),
                    // An opaque (non-DER) key token.
                    _ => Ok((trust, cert, rest2)),
                }
            }
        }
        // No cert; the remainder is an opaque key token.
        None => Ok((trust, &[], rest)),
    }
}

/// Consume one ASN.1 SEQUENCE from the front of `buf`, returning it with its
/// header plus the remainder.
pub(crate) fn take_seq(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    if buf.first() != Some(&0x30) {
        return None;
    }

    let len_byte = *buf.get(1)?;

    let (len, header) = if len_byte & 0x80 == 0 {
        (usize::from(len_byte), 2)
    } else {
        let n = usize::from(len_byte & 0x7f);

        if n == 0 || n > 4 {
            return None;
        }

        let mut len = 0usize;

        for i in 0..n {
            len = len << 8 | usize::from(*buf.get(2 + i)?);
        }

        (len, 2 + n)
    };

    let total = header.checked_add(len)?;

    if buf.len() < total {
        return None;
    }

    Some((&buf[..total], &buf[total..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        (dir, store)
    }

    fn seq(content: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30, content.len() as u8];
        out.extend_from_slice(content);

        out
    }

    #[test]
    fn commit_promotes_temp_set() {
        let (_dir, mut store) = store();

        store
            .write_temp(Cat::Tc, Elem::Uri, b"wss://lns.example:6887\n")
            .unwrap();
        store.write_temp(Cat::Tc, Elem::Trust, b"TRUST").unwrap();
        store.write_temp(Cat::Tc, Elem::Cert, b"").unwrap();

        store.commit(Cat::Tc).unwrap();

        assert_eq!(
            store.uri(Cat::Tc, CredSet::Reg).unwrap().as_deref(),
            Some("wss://lns.example:6887")
        );
        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Reg, Elem::Trust).unwrap(),
            Some(b"TRUST".to_vec())
        );
        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Reg, Elem::Cert).unwrap(),
            Some(Vec::new())
        );

        // No temp residue, no markers.
        assert!(!store.has_pending(Cat::Tc));
        assert!(!store.marker_path(Cat::Tc, Marker::Upd).is_file());
    }

    #[test]
    fn crashed_commit_recovers_forward() {
        let (_dir, mut store) = store();

        std::fs::write(store.elem_path(Cat::Cups, CredSet::Reg, Elem::Uri), b"old").unwrap();

        // Simulate a crash after the marker landed but before the renames.
        store
            .write_temp(Cat::Cups, Elem::Uri, b"https://cups.example:443")
            .unwrap();
        store.touch(&store.marker_path(Cat::Cups, Marker::Upd)).unwrap();

        let mut reopened = Store::new(store.home());
        reopened.recover().unwrap();

        assert_eq!(
            reopened.uri(Cat::Cups, CredSet::Reg).unwrap().as_deref(),
            Some("https://cups.example:443")
        );
        assert!(!reopened.marker_path(Cat::Cups, Marker::Upd).is_file());
        assert!(!reopened.has_pending(Cat::Cups));
    }

    #[test]
    fn crashed_backup_recovers_forward() {
        let (_dir, mut store) = store();

        std::fs::write(store.elem_path(Cat::Tc, CredSet::Reg, Elem::Trust), b"T").unwrap();
        std::fs::write(store.elem_path(Cat::Tc, CredSet::Reg, Elem::Uri), b"wss://x").unwrap();

        // Crash right after the cpy marker: bak half-written from an earlier
        // generation.
        std::fs::write(store.elem_path(Cat::Tc, CredSet::Bak, Elem::Trust), b"STALE").unwrap();
        store.touch(&store.marker_path(Cat::Tc, Marker::Cpy)).unwrap();

        let mut reopened = Store::new(store.home());
        reopened.recover().unwrap();

        assert_eq!(
            reopened.read_elem(Cat::Tc, CredSet::Bak, Elem::Trust).unwrap(),
            Some(b"T".to_vec())
        );
        assert_eq!(
            reopened.read_elem(Cat::Tc, CredSet::Bak, Elem::Uri).unwrap(),
            Some(b"wss://x".to_vec())
        );
        assert!(reopened.marker_path(Cat::Tc, Marker::Done).is_file());
        assert!(!reopened.marker_path(Cat::Tc, Marker::Cpy).is_file());
    }

    #[test]
    fn backup_skipped_while_done_marker_present() {
        let (_dir, mut store) = store();

        std::fs::write(store.elem_path(Cat::Tc, CredSet::Reg, Elem::Trust), b"one").unwrap();
        store.backup(Cat::Tc).unwrap();

        std::fs::write(store.elem_path(Cat::Tc, CredSet::Reg, Elem::Trust), b"two").unwrap();
        store.backup(Cat::Tc).unwrap();

        // Second backup was a no-op.
        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Bak, Elem::Trust).unwrap(),
            Some(b"one".to_vec())
        );

        // A commit invalidates the marker, the next backup runs again.
        store.write_temp(Cat::Tc, Elem::Trust, b"three").unwrap();
        store.commit(Cat::Tc).unwrap();
        store.backup(Cat::Tc).unwrap();

        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Bak, Elem::Trust).unwrap(),
            Some(b"three".to_vec())
        );
    }

    #[test]
    fn reset_drops_staging_only() {
        let (_dir, mut store) = store();

        std::fs::write(store.elem_path(Cat::Cups, CredSet::Reg, Elem::Uri), b"keep").unwrap();

        store.write_temp(Cat::Cups, Elem::Uri, b"staged").unwrap();
        store.touch(&store.marker_path(Cat::Cups, Marker::Upd)).unwrap();

        store.reset_update(Cat::Cups).unwrap();

        assert!(!store.has_pending(Cat::Cups));
        assert!(!store.marker_path(Cat::Cups, Marker::Upd).is_file());
        assert_eq!(
            store.read_elem(Cat::Cups, CredSet::Reg, Elem::Uri).unwrap(),
            Some(b"keep".to_vec())
        );
    }

    #[test]
    fn commit_then_reopen_preserves_uri() {
        let (_dir, mut store) = store();

        store.write_temp(Cat::Tc, Elem::Uri, b"wss://lns.example/\t \n").unwrap();
        store.commit(Cat::Tc).unwrap();

        let mut reopened = Store::new(store.home());
        reopened.recover().unwrap();

        assert_eq!(
            reopened.uri(Cat::Tc, CredSet::Reg).unwrap().as_deref(),
            Some("wss://lns.example/")
        );
    }

    #[test]
    fn cred_crc_tracks_contents() {
        let (_dir, mut store) = store();

        assert_eq!(store.cred_crc(Cat::Tc, CredSet::Reg).unwrap(), 0);

        store.write_temp(Cat::Tc, Elem::Trust, b"AAAA").unwrap();
        store.commit(Cat::Tc).unwrap();

        let first = store.cred_crc(Cat::Tc, CredSet::Reg).unwrap();
        assert_ne!(first, 0);

        store.write_temp(Cat::Tc, Elem::Trust, b"BBBB").unwrap();
        store.commit(Cat::Tc).unwrap();

        assert_ne!(store.cred_crc(Cat::Tc, CredSet::Reg).unwrap(), first);
    }

    #[test]
    fn split_blob_variants() {
        let trust = seq(b"trust");
        let cert = seq(b"cert!");
        let key = seq(b"key..");

        // Three sequences.
        let mut blob = trust.clone();
        blob.extend_from_slice(&cert);
        blob.extend_from_slice(&key);

        let (t, c, k) = split_cred_blob(&blob).unwrap();
        assert_eq!((t, c, k), (trust.as_slice(), cert.as_slice(), key.as_slice()));

        // Trust only.
        let (t, c, k) = split_cred_blob(&trust).unwrap();
        assert_eq!((c.len(), k.len()), (0, 0));
        assert_eq!(t, trust.as_slice());

        // Trust + opaque key token (no cert).
        let mut blob = trust.clone();
        blob.extend_from_slice(b"opaque-token-123");

        let (t, c, k) = split_cred_blob(&blob).unwrap();
        assert_eq!(t, trust.as_slice());
        assert_eq!(c.len(), 0);
        assert_eq!(k, b"opaque-token-123");

        // Garbage.
        assert!(split_cred_blob(b"not-asn1").is_err());
        assert!(split_cred_blob(&[0x30, 0x10, 0x00]).is_err());
    }
}
