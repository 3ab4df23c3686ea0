//! The configuration/update client.
//!
//! On a timer the station POSTs its identity and the CRCs of everything it
//! holds to the CUPS server's `/update-info`. The answer is a stream of
//! length-prefixed segments in fixed order: new URIs, new credential blobs, an
//! ECDSA signature and a firmware image. Segment payloads land in the
//! credential store's staging area and are committed transactionally at the
//! end of a successful round; a verified firmware image is handed to the
//! updater. Persistent failures rotate through the credential sets
//! REG → BAK → BOOT.

use crate::config::{Eui, StationConf, STATION_MODEL, STATION_PACKAGE, STATION_VERSION};
use crate::daemon::SysEvent;
use crate::error::{CupsError, Error};
use crate::sig::{self, SigKey, UpdateVerifier, Verdict, MAX_SIG_LEN};
use crate::store::{self, Cat, CredSet, Elem, Store};
use crate::tls;
use bitflags::bitflags;
use futures_util::StreamExt;
use serde_json::json;
use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};

/// First CUPS round shortly after boot.
const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Retry interval after failures and after a config change that warrants an
/// immediate re-handshake.
const SHORT_RETRY: Duration = Duration::from_secs(60);

/// Failures on one credential set before rotating to the next.
const MAX_FAILS: u32 = 6;

/// Largest credential blob accepted from the server.
const MAX_CRED_LEN: usize = 8 * 1024;

/// End-to-end HTTP timeout of one round.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

bitflags! {
    /// Which segments of the response carried data.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        /// New CUPS URI staged.
        const CUPS_URI = 1 << 0;
        /// New TC URI staged.
        const TC_URI = 1 << 1;
        /// New CUPS credentials staged.
        const CUPS_CRED = 1 << 2;
        /// New TC credentials staged.
        const TC_CRED = 1 << 3;
        /// A signature arrived for the firmware image.
        const SIGNATURE = 1 << 4;
        /// A firmware image arrived and passed the on-disk sanity check.
        const UPDATE = 1 << 5;
    }
}

/// Segment order of the response body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Seg {
    CupsUri,
    TcUri,
    CupsCred,
    TcCred,
    Signature,
    Update,
    Done,
}

impl Seg {
    /// Width of the length prefix in bytes.
    fn len_width(self) -> usize {
        match self {
            Seg::CupsUri | Seg::TcUri => 1,
            Seg::CupsCred | Seg::TcCred => 2,
            Seg::Signature | Seg::Update => 4,
            Seg::Done => 0,
        }
    }

    fn next(self) -> Seg {
        match self {
            Seg::CupsUri => Seg::TcUri,
            Seg::TcUri => Seg::CupsCred,
            Seg::CupsCred => Seg::TcCred,
            Seg::TcCred => Seg::Signature,
            Seg::Signature => Seg::Update,
            Seg::Update | Seg::Done => Seg::Done,
        }
    }

    /// Allocation limit for the declared segment length. The firmware image
    /// streams to disk and is unbounded here.
    fn limit(self) -> usize {
        match self {
            Seg::CupsUri | Seg::TcUri => crate::MAX_URI_LEN,
            Seg::CupsCred | Seg::TcCred => MAX_CRED_LEN,
            Seg::Signature => 4 + MAX_SIG_LEN,
            Seg::Update | Seg::Done => usize::MAX,
        }
    }
}

/// Where segment payloads go. Implemented by the live session (credential
/// store + update file) and by recording sinks in tests.
pub(crate) trait CupsSink {
    fn uri_update(&mut self, cat: Cat, uri: &[u8]) -> Result<(), Error>;
    fn cred_start(&mut self, cat: Cat, len: usize) -> Result<(), Error>;
    fn cred_write(&mut self, cat: Cat, data: &[u8]) -> Result<(), Error>;
    fn cred_complete(&mut self, cat: Cat) -> Result<(), Error>;
    fn signature(&mut self, keycrc: u32, der: &[u8]) -> Result<(), Error>;
    fn update_start(&mut self, len: usize) -> Result<(), Error>;
    fn update_write(&mut self, data: &[u8]) -> Result<(), Error>;
    fn update_commit(&mut self, len: usize) -> Result<bool, Error>;
}

/// Incremental parser over the segment protocol.
///
/// Chunk boundaries are arbitrary: a length prefix may arrive byte by byte
/// (buffered through a 4-byte scratch), a payload may span many chunks.
pub(crate) struct SegmentReader {
    seg: Seg,
    scratch: [u8; 4],
    scratch_fill: usize,
    /// `None` while reading the length prefix.
    body: Option<(usize, usize)>,
    /// Small segments (URIs, signature) buffered whole.
    buf: Vec<u8>,
}

impl SegmentReader {
    pub(crate) fn new() -> Self {
        Self {
            seg: Seg::CupsUri,
            scratch: [0; 4],
            scratch_fill: 0,
            body: None,
            buf: Vec::new(),
        }
    }

    /// Consume one HTTP body chunk.
    pub(crate) fn feed(&mut self, mut chunk: &[u8], sink: &mut dyn CupsSink) -> Result<(), Error> {
        while !chunk.is_empty() {
            if self.seg == Seg::Done {
                log::warn!("{} trailing bytes after the update segment", chunk.len());

                return Err(CupsError::Transfer.into());
            }

            match self.body {
                None => {
                    let width = self.seg.len_width();

                    let take = (width - self.scratch_fill).min(chunk.len());
                    self.scratch[self.scratch_fill..self.scratch_fill + take]
                        .copy_from_slice(&chunk[..take]);
                    self.scratch_fill += take;
                    chunk = &chunk[take..];

                    if self.scratch_fill < width {
                        continue;
                    }

                    self.scratch_fill = 0;

                    let mut len = 0usize;

                    for i in (0..width).rev() {
                        len = len << 8 | usize::from(self.scratch[i]);
                    }

                    if len > self.seg.limit() {
                        return Err(CupsError::SegmentTooLong {
                            declared: len,
                            limit: self.seg.limit(),
                        }
                        .into());
                    }

                    if len == 0 {
                        // "No change", move on.
                        self.seg = self.seg.next();

                        continue;
                    }

                    if self.seg == Seg::Signature && len < 4 {
                        return Err(CupsError::SegmentTooLong {
                            declared: len,
                            limit: self.seg.limit(),
                        }
                        .into());
                    }

                    self.begin_segment(len, sink)?;
                    self.body = Some((len, 0));
                }

                Some((len, off)) => {
                    let take = (len - off).min(chunk.len());
                    let data = &chunk[..take];
                    chunk = &chunk[take..];

                    self.segment_data(data, sink)?;

                    if off + take == len {
                        self.end_segment(len, sink)?;

                        self.body = None;
                        self.buf.clear();
                        self.seg = self.seg.next();
                    } else {
                        self.body = Some((len, off + take));
                    }
                }
            }
        }

        Ok(())
    }

    /// Body complete: everything must be consumed.
    pub(crate) fn finish(&self) -> Result<(), Error> {
        if self.body.is_some() || self.scratch_fill != 0 {
            return Err(CupsError::TruncatedBody.into());
        }

        Ok(())
    }

    fn begin_segment(&mut self, len: usize, sink: &mut dyn CupsSink) -> Result<(), Error> {
        match self.seg {
            Seg::CupsCred => sink.cred_start(Cat::Cups, len),
            Seg::TcCred => sink.cred_start(Cat::Tc, len),
            Seg::Update => sink.update_start(len),
            _ => Ok(()),
        }
    }

    fn segment_data(&mut self, data: &[u8], sink: &mut dyn CupsSink) -> Result<(), Error> {
        match self.seg {
            Seg::CupsUri | Seg::TcUri | Seg::Signature => {
                self.buf.extend_from_slice(data);

                Ok(())
            }
            Seg::CupsCred => sink.cred_write(Cat::Cups, data),
            Seg::TcCred => sink.cred_write(Cat::Tc, data),
            Seg::Update => sink.update_write(data),
            Seg::Done => Ok(()),
        }
    }

    fn end_segment(&mut self, len: usize, sink: &mut dyn CupsSink) -> Result<(), Error> {
        match self.seg {
            Seg::CupsUri => sink.uri_update(Cat::Cups, &self.buf),
            Seg::TcUri => sink.uri_update(Cat::Tc, &self.buf),
            Seg::CupsCred => sink.cred_complete(Cat::Cups),
            Seg::TcCred => sink.cred_complete(Cat::Tc),
            Seg::Signature => {
                let keycrc = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

                sink.signature(keycrc, &self.buf[4..])
            }
            Seg::Update => {
                sink.update_commit(len)?;

                Ok(())
            }
            Seg::Done => Ok(()),
        }
    }
}

/// The live sink: URIs and credentials into the store's staging area, the
/// firmware image to disk with a streaming digest.
struct SessionSink {
    store: Rc<RefCell<Store>>,
    flags: UpdateFlags,
    cred: Option<(Cat, Vec<u8>)>,
    verifier: Option<UpdateVerifier>,
    update_path: PathBuf,
    update_file: Option<std::fs::File>,
    update_written: usize,
}

impl SessionSink {
    fn new(store: Rc<RefCell<Store>>) -> Self {
        let update_path = store.borrow().home().join("update.bin");

        Self {
            store,
            flags: UpdateFlags::default(),
            cred: None,
            verifier: None,
            update_path,
            update_file: None,
            update_written: 0,
        }
    }

    fn uri_flag(cat: Cat) -> UpdateFlags {
        match cat {
            Cat::Cups => UpdateFlags::CUPS_URI,
            Cat::Tc => UpdateFlags::TC_URI,
        }
    }

    fn cred_flag(cat: Cat) -> UpdateFlags {
        match cat {
            Cat::Cups => UpdateFlags::CUPS_CRED,
            Cat::Tc => UpdateFlags::TC_CRED,
        }
    }
}

impl CupsSink for SessionSink {
    fn uri_update(&mut self, cat: Cat, uri: &[u8]) -> Result<(), Error> {
        self.store
            .borrow_mut()
            .write_temp(cat, Elem::Uri, uri)
            .map_err(Error::Store)?;

        self.flags |= Self::uri_flag(cat);

        log::info!("{:?}: new URI staged", cat);

        Ok(())
    }

    fn cred_start(&mut self, cat: Cat, len: usize) -> Result<(), Error> {
        self.cred = Some((cat, Vec::with_capacity(len)));

        Ok(())
    }

    fn cred_write(&mut self, cat: Cat, data: &[u8]) -> Result<(), Error> {
        match &mut self.cred {
            Some((c, buf)) if *c == cat => {
                buf.extend_from_slice(data);

                Ok(())
            }
            _ => Err(Error::Internal),
        }
    }

    fn cred_complete(&mut self, cat: Cat) -> Result<(), Error> {
        let (c, blob) = self.cred.take().ok_or(Error::Internal)?;

        if c != cat {
            return Err(Error::Internal);
        }

        let (trust, cert, key) = store::split_cred_blob(&blob).map_err(Error::Store)?;

        // Empty slots become empty files so backup sets stay uniform.
        let mut store = self.store.borrow_mut();
        store.write_temp(cat, Elem::Trust, trust).map_err(Error::Store)?;
        store.write_temp(cat, Elem::Cert, cert).map_err(Error::Store)?;
        store.write_temp(cat, Elem::Key, key).map_err(Error::Store)?;

        self.flags |= Self::cred_flag(cat);

        log::info!("{:?}: new credentials staged ({} bytes)", cat, blob.len());

        Ok(())
    }

    fn signature(&mut self, keycrc: u32, der: &[u8]) -> Result<(), Error> {
        log::info!(
            "update signature announced, key crc {:#010x}, {} bytes",
            keycrc,
            der.len()
        );

        self.verifier = Some(UpdateVerifier::new(keycrc, der.to_vec()));
        self.flags |= UpdateFlags::SIGNATURE;

        Ok(())
    }

    fn update_start(&mut self, len: usize) -> Result<(), Error> {
        // The updater must see the freshly pushed configuration: commit
        // anything staged so far before the image lands.
        {
            let mut store = self.store.borrow_mut();

            for cat in Cat::ALL {
                if store.has_pending(cat) {
                    store.commit(cat).map_err(Error::Store)?;
                }
            }
        }

        log::info!("receiving firmware update, {} bytes", len);

        self.update_file = Some(std::fs::File::create(&self.update_path)?);
        self.update_written = 0;

        Ok(())
    }

    fn update_write(&mut self, data: &[u8]) -> Result<(), Error> {
        let file = self.update_file.as_mut().ok_or(Error::Internal)?;

        file.write_all(data)?;
        self.update_written += data.len();

        if let Some(verifier) = &mut self.verifier {
            verifier.update(data);
        }

        Ok(())
    }

    fn update_commit(&mut self, len: usize) -> Result<bool, Error> {
        let file = self.update_file.take().ok_or(Error::Internal)?;

        file.sync_all()?;

        if self.update_written != len {
            log::error!(
                "update image truncated: {} of {} bytes",
                self.update_written,
                len
            );

            return Ok(false);
        }

        self.flags |= UpdateFlags::UPDATE;

        Ok(true)
    }
}

/// Decide whether a received update may run.
///
/// A station without any signature key accepts unsigned images; as soon as at
/// least one key file exists a verifying signature is mandatory.
pub(crate) fn update_allowed(keys: &[SigKey], verifier: Option<UpdateVerifier>) -> bool {
    if keys.is_empty() {
        return true;
    }

    match verifier {
        Some(v) => v.verify(keys) == Verdict::Verified,
        None => false,
    }
}

/// Control messages from the daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CupsCtl {
    /// TC gave up; run a round right away.
    TriggerNow,
    /// TC connected fine; the next check can wait a full nominal interval.
    Delay,
}

/// The CUPS engine. One per process, timer-driven.
pub struct CupsEngine {
    eui: Eui,
    store: Rc<RefCell<Store>>,
    ctl: mpsc::Receiver<CupsCtl>,
    events: mpsc::Sender<SysEvent>,
    state: watch::Sender<i32>,
    credset: CredSet,
    fail_count: u32,
    nominal: Duration,
}

/// Outcome of one finished round.
struct RoundResult {
    flags: UpdateFlags,
    verifier: Option<UpdateVerifier>,
}

impl CupsEngine {
    /// Assemble the engine.
    pub fn new(
        conf: &StationConf,
        store: Rc<RefCell<Store>>,
        ctl: mpsc::Receiver<CupsCtl>,
        events: mpsc::Sender<SysEvent>,
        state: watch::Sender<i32>,
    ) -> Self {
        Self {
            eui: conf.routerid,
            store,
            ctl,
            events,
            state,
            credset: CredSet::Reg,
            fail_count: 0,
            nominal: Duration::from_secs(conf.cups_interval),
        }
    }

    /// Timer loop; runs until the daemon goes away.
    pub async fn run(mut self) {
        let mut next = Instant::now() + INITIAL_DELAY;

        loop {
            tokio::select! {
                _ = sleep_until(next) => {
                    let delay = self.round().await;

                    next = Instant::now() + delay;
                }

                ctl = self.ctl.recv() => {
                    match ctl {
                        None => return,
                        Some(CupsCtl::TriggerNow) => next = Instant::now(),
                        Some(CupsCtl::Delay) => next = Instant::now() + self.nominal,
                    }
                }
            }
        }
    }

    async fn round(&mut self) -> Duration {
        let _ = self.state.send(1);

        match self.fetch().await {
            Ok(result) => {
                let _ = self.state.send(0);

                self.finish_success(result).await
            }
            Err(e) => {
                log::warn!("CUPS round failed ({:?}): {}", self.credset, e);

                let _ = self.state.send(match &e {
                    Error::Cups(CupsError::Rejected { .. }) => -2,
                    _ => -1,
                });

                // Drop anything half-staged; the committed sets stay intact.
                {
                    let mut store = self.store.borrow_mut();

                    for cat in Cat::ALL {
                        if let Err(e) = store.reset_update(cat) {
                            log::error!("cannot reset staging area: {}", e);
                        }
                    }
                }

                self.account_failure();

                SHORT_RETRY
            }
        }
    }

    /// Count a failed round; rotate through the credential sets after
    /// repeated failures on the same set.
    fn account_failure(&mut self) {
        self.fail_count += 1;

        if self.fail_count > MAX_FAILS {
            let from = self.credset;
            self.credset = self.credset.rotate();
            self.fail_count = 0;

            log::warn!(
                "CUPS rotating credentials {:?} -> {:?}",
                from,
                self.credset
            );
        }
    }

    /// Apply the per-segment results of a successful round; returns the delay
    /// until the next check.
    async fn finish_success(&mut self, result: RoundResult) -> Duration {
        let RoundResult { flags, verifier } = result;

        if flags.contains(UpdateFlags::UPDATE) {
            let keys = sig::load_keys(self.store.borrow().home());

            if update_allowed(&keys, verifier) {
                self.run_update();
            } else {
                log::error!("update signature did not verify, image discarded");

                let path = self.store.borrow().home().join("update.bin");
                let _ = std::fs::remove_file(path);
            }
        }

        // Promote whatever is still staged (an update segment may have
        // committed already).
        {
            let mut store = self.store.borrow_mut();

            for cat in Cat::ALL {
                if store.has_pending(cat) {
                    if let Err(e) = store.commit(cat) {
                        log::error!("commit failed: {}", e);

                        let _ = store.reset_update(cat);
                    }
                }
            }
        }

        let tc_changed = flags.intersects(UpdateFlags::TC_URI | UpdateFlags::TC_CRED);
        let cups_changed = flags.intersects(UpdateFlags::CUPS_URI | UpdateFlags::CUPS_CRED);

        self.credset = CredSet::Reg;
        self.fail_count = 0;

        let _ = self.events.send(SysEvent::CupsRoundDone { tc_changed }).await;

        if cups_changed {
            // Re-handshake promptly under the new CUPS identity.
            SHORT_RETRY
        } else {
            self.nominal
        }
    }

    /// One HTTP exchange: POST our identity, stream the segment response.
    async fn fetch(&mut self) -> Result<RoundResult, Error> {
        let uri = self
            .store
            .borrow_mut()
            .uri(Cat::Cups, self.credset)
            .map_err(Error::Store)?
            .ok_or(CupsError::NoUri)?;

        let body = self.request_body()?;

        let tls = tls::client_config(&mut self.store.borrow_mut(), Cat::Cups, self.credset)?;

        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);

        if let Some(config) = &tls {
            builder = builder.use_preconfigured_tls((**config).clone());
        }

        let client = builder.build().map_err(|e| {
            log::error!("HTTP client setup failed: {}", e);

            Error::Cups(CupsError::Transfer)
        })?;

        log::info!("CUPS check at {} ({:?})", uri, self.credset);

        let response = client
            .post(format!("{}/update-info", uri.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                log::warn!("CUPS request failed: {}", e);

                Error::Cups(CupsError::Transfer)
            })?;

        let status = response.status();

        if status != reqwest::StatusCode::OK {
            return Err(CupsError::Rejected {
                status: status.as_u16(),
            }
            .into());
        }

        let mut sink = SessionSink::new(Rc::clone(&self.store));
        let mut reader = SegmentReader::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                log::warn!("CUPS transfer failed mid-stream: {}", e);

                Error::Cups(CupsError::Transfer)
            })?;

            reader.feed(&chunk, &mut sink)?;
        }

        reader.finish()?;

        Ok(RoundResult {
            flags: sink.flags,
            verifier: sink.verifier,
        })
    }

    fn request_body(&mut self) -> Result<serde_json::Value, Error> {
        let mut store = self.store.borrow_mut();

        let cups_uri = store.uri(Cat::Cups, self.credset).map_err(Error::Store)?;
        let tc_uri = store.uri(Cat::Tc, self.credset).map_err(Error::Store)?;
        let cups_crc = store.cred_crc(Cat::Cups, self.credset).map_err(Error::Store)?;
        let tc_crc = store.cred_crc(Cat::Tc, self.credset).map_err(Error::Store)?;

        let keys: Vec<u32> = sig::load_keys(store.home()).iter().map(|k| k.crc).collect();

        Ok(json!({
            "router": self.eui.to_string(),
            "cupsUri": cups_uri.unwrap_or_default(),
            "tcUri": tc_uri.unwrap_or_default(),
            "cupsCredCrc": cups_crc,
            "tcCredCrc": tc_crc,
            "station": STATION_VERSION,
            "model": STATION_MODEL,
            "package": STATION_PACKAGE,
            "keys": keys,
        }))
    }

    /// Hand the validated image to the updater.
    fn run_update(&self) {
        let path = self.store.borrow().home().join("update.bin");

        log::warn!("running firmware update {}", path.display());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            {
                log::error!("cannot mark update executable: {}", e);

                return;
            }
        }

        match std::process::Command::new(&path).spawn() {
            Ok(child) => log::info!("updater started, pid {}", child.id()),
            Err(e) => log::error!("updater failed to start: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Records every sink call for assertions.
    #[derive(Default)]
    struct RecordingSink {
        uris: Vec<(Cat, Vec<u8>)>,
        creds: Vec<(Cat, Vec<u8>)>,
        cred_open: Option<(Cat, Vec<u8>)>,
        signature: Option<(u32, Vec<u8>)>,
        update: Vec<u8>,
        update_declared: Option<usize>,
        committed: Option<usize>,
    }

    impl CupsSink for RecordingSink {
        fn uri_update(&mut self, cat: Cat, uri: &[u8]) -> Result<(), Error> {
            self.uris.push((cat, uri.to_vec()));

            Ok(())
        }

        fn cred_start(&mut self, cat: Cat, _len: usize) -> Result<(), Error> {
            self.cred_open = Some((cat, Vec::new()));

            Ok(())
        }

        fn cred_write(&mut self, _cat: Cat, data: &[u8]) -> Result<(), Error> {
            self.cred_open.as_mut().unwrap().1.extend_from_slice(data);

            Ok(())
        }

        fn cred_complete(&mut self, _cat: Cat) -> Result<(), Error> {
            let done = self.cred_open.take().unwrap();
            self.creds.push(done);

            Ok(())
        }

        fn signature(&mut self, keycrc: u32, der: &[u8]) -> Result<(), Error> {
            self.signature = Some((keycrc, der.to_vec()));

            Ok(())
        }

        fn update_start(&mut self, len: usize) -> Result<(), Error> {
            self.update_declared = Some(len);

            Ok(())
        }

        fn update_write(&mut self, data: &[u8]) -> Result<(), Error> {
            self.update.extend_from_slice(data);

            Ok(())
        }

        fn update_commit(&mut self, len: usize) -> Result<bool, Error> {
            self.committed = Some(len);

            Ok(true)
        }
    }

    fn segment(width: usize, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..width]);
        out.extend_from_slice(payload);

        out
    }

    fn full_response() -> Vec<u8> {
        let mut body = Vec::new();

        body.extend(segment(1, b"https://cups.example:443"));
        body.extend(segment(1, b"wss://lns.example:6887"));
        body.extend(segment(2, &[]));
        body.extend(segment(2, b"\x30\x02ab"));

        let mut sig = 0xdeadbeefu32.to_le_bytes().to_vec();
        sig.extend_from_slice(&[0x30, 0x06, 1, 2, 3, 4, 5, 6]);
        body.extend(segment(4, &sig));

        body.extend(segment(4, &[0xab; 300]));

        body
    }

    #[test]
    fn whole_body_in_one_chunk() {
        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        reader.feed(&full_response(), &mut sink).unwrap();
        reader.finish().unwrap();

        assert_eq!(
            sink.uris,
            vec![
                (Cat::Cups, b"https://cups.example:443".to_vec()),
                (Cat::Tc, b"wss://lns.example:6887".to_vec()),
            ]
        );

        // The zero-length cupsCred segment produced no calls.
        assert_eq!(sink.creds.len(), 1);
        assert_eq!(sink.creds[0].0, Cat::Tc);

        let (keycrc, der) = sink.signature.unwrap();
        assert_eq!(keycrc, 0xdeadbeef);
        assert_eq!(der.len(), 8);

        assert_eq!(sink.update.len(), 300);
        assert_eq!(sink.committed, Some(300));
    }

    #[test]
    fn byte_at_a_time_parses_identically() {
        let body = full_response();

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        for byte in &body {
            reader.feed(std::slice::from_ref(byte), &mut sink).unwrap();
        }

        reader.finish().unwrap();

        assert_eq!(sink.uris.len(), 2);
        assert_eq!(sink.update.len(), 300);
        assert!(sink.signature.is_some());
    }

    #[test]
    fn all_zero_segments_mean_no_change() {
        let mut body = Vec::new();

        body.extend(segment(1, &[]));
        body.extend(segment(1, &[]));
        body.extend(segment(2, &[]));
        body.extend(segment(2, &[]));
        body.extend(segment(4, &[]));
        body.extend(segment(4, &[]));

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        reader.feed(&body, &mut sink).unwrap();
        reader.finish().unwrap();

        assert!(sink.uris.is_empty());
        assert!(sink.creds.is_empty());
        assert!(sink.signature.is_none());
        assert_eq!(sink.update_declared, None);
    }

    #[test]
    fn oversized_uri_is_a_protocol_error() {
        // A 1-byte length can never overflow its field, but the URI limit is
        // what the scratch buffer allocates for.
        let mut body = vec![255u8];
        body.extend(std::iter::repeat(b'x').take(255));

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        // 255 <= MAX_URI_LEN, fine...
        reader.feed(&body, &mut sink).unwrap();

        // ...but an oversized credential length dies immediately.
        let mut body = segment(1, &[]);
        body.extend(segment(1, &[]));
        body.extend((MAX_CRED_LEN as u16 + 1).to_le_bytes());

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        assert!(reader.feed(&body, &mut sink).is_err());
    }

    #[test]
    fn short_signature_segment_is_rejected() {
        let mut body = segment(1, &[]);
        body.extend(segment(1, &[]));
        body.extend(segment(2, &[]));
        body.extend(segment(2, &[]));
        // Signature segment of 3 bytes cannot even hold the key CRC.
        body.extend(segment(4, &[1, 2, 3]));

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        assert!(reader.feed(&body, &mut sink).is_err());
    }

    #[test]
    fn truncated_body_fails_finish() {
        let body = full_response();

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        reader.feed(&body[..body.len() - 10], &mut sink).unwrap();

        assert!(reader.finish().is_err());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut body = full_response();
        body.push(0x00);

        let mut sink = RecordingSink::default();
        let mut reader = SegmentReader::new();

        assert!(reader.feed(&body, &mut sink).is_err());
    }

    #[test]
    fn unsigned_update_allowed_only_without_keys() {
        use p256::ecdsa::SigningKey;

        assert!(update_allowed(&[], None));

        let signing = SigningKey::random(&mut rand_core::OsRng);
        let point = signing.verifying_key().to_encoded_point(false);

        let mut raw = Vec::new();
        raw.extend_from_slice(point.x().unwrap());
        raw.extend_from_slice(point.y().unwrap());

        let key = SigKey::from_raw(&raw).unwrap();

        assert!(!update_allowed(&[key], None));
    }

    #[test]
    fn failure_accounting_rotates_credsets() {
        let (_ctl_tx, ctl_rx) = mpsc::channel(1);
        let (ev_tx, _ev_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(0);

        let dir = tempfile::tempdir().unwrap();

        let conf: StationConf = serde_json::from_str(
            r#"{ "routerid": "1-2-3-4-5-6-7-8" }"#,
        )
        .unwrap();

        let mut engine = CupsEngine::new(
            &conf,
            Rc::new(RefCell::new(Store::new(dir.path()))),
            ctl_rx,
            ev_tx,
            state_tx,
        );

        // Seven failures on REG rotate to BAK...
        for _ in 0..7 {
            assert_eq!(engine.credset, CredSet::Reg);
            engine.account_failure();
        }

        assert_eq!(engine.credset, CredSet::Bak);
        assert_eq!(engine.fail_count, 0);

        // ...seven more reach BOOT, then wrap to REG.
        for _ in 0..7 {
            engine.account_failure();
        }
        assert_eq!(engine.credset, CredSet::Boot);

        for _ in 0..7 {
            engine.account_failure();
        }
        assert_eq!(engine.credset, CredSet::Reg);
    }
}
