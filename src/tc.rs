//! The LNS transport engine.
//!
//! One `TcEngine` owns the station's connection to the network server. A
//! session walks `INFOS` discovery (ask `/router-info` which MUXS endpoint
//! serves this gateway) and then holds a long-lived MUXS WebSocket carrying
//! uplinks out and downlink jobs in. Every terminal error funnels through one
//! reconnection policy: fast MUXS-only reconnects for clean closes, slower
//! INFOS rediscovery otherwise, and a handover to CUPS when the server rejects
//! us or we run out of retries.

use crate::config::{
    Eui, PROTOCOL_VERSION, STATION_FEATURES, STATION_MODEL, STATION_PACKAGE, STATION_VERSION,
};
use crate::daemon::SysEvent;
use crate::ral::{Ral, RxJob, TxResult};
use crate::s2e::{S2e, S2eAction};
use crate::store::{Cat, CredSet, Store};
use crate::timesync::{ustime_now, Timesync, Ustime};
use crate::tls;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect / INFOS-reply timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Period of station-initiated LNS time exchanges while connected.
const TIMESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Retries after which TC gives up and hands over to CUPS.
const MAX_RETRIES: u32 = 10;

/// Retries up to which a clean close gets a fast MUXS-only reconnect.
const MAX_FAST_RETRIES: u32 = 4;

/// Engine states. Progress states map to non-negative scalars, terminal
/// errors to negative ones; the pair is what the monitoring surface exposes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TcState {
    /// Freshly allocated session.
    Ini,
    /// Connected to `/router-info`, awaiting the response.
    InfosReqPend,
    /// INFOS response parsed, MUXS URI stored.
    InfosGotUri,
    /// Connecting to the MUXS WebSocket.
    MuxsReqPend,
    /// Operational.
    MuxsConnected,
    /// Waiting to re-run INFOS discovery.
    InfosBackoff,
    /// Waiting to reconnect to the cached MUXS URI.
    MuxsBackoff,
    /// Terminal error.
    Error(TcErr),
}

impl TcState {
    /// The monitoring scalar for this state.
    pub fn code(self) -> i32 {
        match self {
            TcState::Ini => 0,
            TcState::InfosReqPend => 1,
            TcState::InfosGotUri => 2,
            TcState::MuxsReqPend => 3,
            TcState::MuxsConnected => 4,
            TcState::InfosBackoff => 5,
            TcState::MuxsBackoff => 6,
            TcState::Error(e) => e.code(),
        }
    }
}

/// Terminal session error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TcErr {
    /// Connect failed, or the session died outside `MUXS_CONNECTED`.
    Failed,
    /// No URI configured for the current credential set.
    NoUri,
    /// The connection timeout fired.
    Timeout,
    /// The server answered with an error or an unusable INFOS response.
    Rejected,
    /// The connection closed while operational; eligible for fast reconnect.
    Closed,
    /// The engine is parked (handed over to CUPS).
    Dead,
}

impl TcErr {
    fn code(self) -> i32 {
        match self {
            TcErr::Failed => -1,
            TcErr::NoUri => -2,
            TcErr::Timeout => -3,
            TcErr::Rejected => -4,
            TcErr::Closed => -5,
            TcErr::Dead => -6,
        }
    }
}

/// What the reconnection policy decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum NextStep {
    /// Stop TC and let CUPS fetch fresh configuration.
    TriggerCups,
    /// Reconnect straight to the cached MUXS URI after the delay.
    MuxsBackoff(Duration),
    /// Redo INFOS discovery after the delay.
    InfosBackoff(Duration),
}

/// The reconnection policy of §"LNS transport".
///
/// `retries` is the value before this failure is accounted.
pub(crate) fn next_step(err: TcErr, retries: u32, has_muxs_uri: bool, cups_enabled: bool) -> NextStep {
    if cups_enabled && (err == TcErr::Rejected || err == TcErr::NoUri || retries >= MAX_RETRIES) {
        return NextStep::TriggerCups;
    }

    if err == TcErr::Closed && has_muxs_uri && retries <= MAX_FAST_RETRIES {
        return NextStep::MuxsBackoff(Duration::from_secs(1 << retries));
    }

    NextStep::InfosBackoff(Duration::from_secs(u64::from(retries.clamp(1, 6)) * 10))
}

/// Parsed INFOS response.
#[derive(Debug, Deserialize)]
struct InfosResp {
    #[serde(default)]
    router: Option<serde_json::Value>,
    #[serde(default)]
    muxs: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Validate an INFOS reply into the MUXS URI.
pub(crate) fn parse_infos(text: &str) -> Result<String, TcErr> {
    let resp: InfosResp = serde_json::from_str(text).map_err(|_| TcErr::Rejected)?;

    if let Some(error) = resp.error {
        log::error!("INFOS rejected us: {}", error);

        return Err(TcErr::Rejected);
    }

    let uri = resp.uri.ok_or(TcErr::Rejected)?;

    if !uri.starts_with("ws://") && !uri.starts_with("wss://") {
        log::error!("INFOS returned non-websocket URI `{}`", uri);

        return Err(TcErr::Rejected);
    }

    log::info!(
        "INFOS: router {:?} served by muxs {:?} at {}",
        resp.router,
        resp.muxs,
        uri
    );

    Ok(uri)
}

/// Control messages from the daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TcCtl {
    /// Tear the session down and park.
    Stop,
    /// (Re)start from scratch with REG credentials.
    Restart,
}

enum SessionEnd {
    Err(TcErr, /* reached muxs */ bool),
    Ctl(TcCtl),
    Exit,
}

/// The LNS transport engine. One per process.
pub struct TcEngine {
    eui: Eui,
    cups_enabled: bool,
    store: Rc<RefCell<Store>>,
    timesync: Rc<RefCell<Timesync>>,
    ral: Ral,
    uplinks: mpsc::Receiver<RxJob>,
    ctl: mpsc::Receiver<TcCtl>,
    events: mpsc::Sender<SysEvent>,
    state: watch::Sender<i32>,
    s2e: S2e,
    credset: CredSet,
    retries: u32,
    muxs_uri: Option<String>,
    /// Echo of the last station-initiated time request, for strict anchoring.
    pending_timesync: Option<Ustime>,
}

impl TcEngine {
    /// Assemble the engine. `run` consumes it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        eui: Eui,
        region: u16,
        cups_enabled: bool,
        store: Rc<RefCell<Store>>,
        timesync: Rc<RefCell<Timesync>>,
        ral: Ral,
        uplinks: mpsc::Receiver<RxJob>,
        ctl: mpsc::Receiver<TcCtl>,
        events: mpsc::Sender<SysEvent>,
        state: watch::Sender<i32>,
    ) -> Self {
        Self {
            eui,
            cups_enabled,
            store,
            timesync,
            ral,
            uplinks,
            ctl,
            events,
            state,
            s2e: S2e::new(eui, region),
            credset: CredSet::Reg,
            retries: 0,
            muxs_uri: None,
            pending_timesync: None,
        }
    }

    fn set_state(&self, state: TcState) {
        let _ = self.state.send(state.code());
    }

    /// Run until the daemon goes away.
    pub async fn run(mut self) {
        loop {
            let end = self.run_session().await;

            match end {
                SessionEnd::Exit => return,
                SessionEnd::Ctl(TcCtl::Restart) => self.reset(),
                SessionEnd::Ctl(TcCtl::Stop) => {
                    self.set_state(TcState::Error(TcErr::Dead));

                    if !self.park().await {
                        return;
                    }
                }
                SessionEnd::Err(err, reached_muxs) => {
                    self.set_state(TcState::Error(err));

                    if !self.ondone(err, reached_muxs).await {
                        return;
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.credset = CredSet::Reg;
        self.retries = 0;
        self.muxs_uri = None;
        self.set_state(TcState::Ini);
    }

    /// Park until the daemon restarts us. `false` when the daemon is gone.
    async fn park(&mut self) -> bool {
        loop {
            match self.ctl.recv().await {
                None => return false,
                Some(TcCtl::Restart) => {
                    self.reset();

                    return true;
                }
                Some(TcCtl::Stop) => {}
            }
        }
    }

    /// Apply the reconnection policy. `false` when the daemon is gone.
    async fn ondone(&mut self, err: TcErr, reached_muxs: bool) -> bool {
        match next_step(err, self.retries, self.muxs_uri.is_some(), self.cups_enabled) {
            NextStep::TriggerCups => {
                log::warn!("TC giving up ({:?} after {} retries), triggering CUPS", err, self.retries);

                let _ = self.events.send(SysEvent::TriggerCups).await;

                self.set_state(TcState::Error(TcErr::Dead));

                self.park().await
            }

            NextStep::MuxsBackoff(delay) => {
                log::info!("MUXS reconnect in {:?} (retry {})", delay, self.retries);

                self.set_state(TcState::MuxsBackoff);

                match self.idle_wait(delay).await {
                    Some(TcCtl::Stop) => {
                        self.set_state(TcState::Error(TcErr::Dead));

                        self.park().await
                    }
                    Some(TcCtl::Restart) => {
                        self.reset();

                        true
                    }
                    None => {
                        self.retries += 1;

                        true
                    }
                }
            }

            NextStep::InfosBackoff(delay) => {
                // Fall back to rediscovery: the cached MUXS URI is stale.
                self.muxs_uri = None;

                self.retries = if reached_muxs { 1 } else { self.retries + 1 };

                log::info!("INFOS rediscovery in {:?} (retry {})", delay, self.retries);

                self.set_state(TcState::InfosBackoff);

                match self.idle_wait(delay).await {
                    Some(TcCtl::Stop) => {
                        self.set_state(TcState::Error(TcErr::Dead));

                        self.park().await
                    }
                    Some(TcCtl::Restart) => {
                        self.reset();

                        true
                    }
                    None => true,
                }
            }
        }
    }

    /// Sleep while keeping the uplink ring drained. Returns early on control.
    async fn idle_wait(&mut self, dur: Duration) -> Option<TcCtl> {
        let deadline = Instant::now() + dur;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return None,

                job = self.uplinks.recv() => {
                    if let Some(job) = job {
                        if !self.s2e.queue.try_add(job) {
                            log::error!("uplink ring full while disconnected, frame dropped");
                        }
                    }
                }

                ctl = self.ctl.recv() => {
                    return Some(ctl.unwrap_or(TcCtl::Stop));
                }
            }
        }
    }

    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(TcState::Ini);

        // INFOS discovery, unless a MUXS URI is cached from the last session.
        if self.muxs_uri.is_none() {
            match self.infos_exchange().await {
                Ok(uri) => {
                    self.muxs_uri = Some(uri);
                    self.set_state(TcState::InfosGotUri);
                }
                Err(end) => return end,
            }
        }

        let uri = match &self.muxs_uri {
            Some(uri) => uri.clone(),
            None => return SessionEnd::Err(TcErr::NoUri, false),
        };

        self.set_state(TcState::MuxsReqPend);

        let mut ws = match self.connect(&uri).await {
            Ok(ws) => ws,
            Err(err) => return SessionEnd::Err(err, false),
        };

        self.set_state(TcState::MuxsConnected);

        log::info!("MUXS connected ({:?}, retries {})", self.credset, self.retries);

        // First successful connect on the active set makes it the known-good
        // backup, and CUPS can relax.
        if self.credset == CredSet::Reg {
            if let Err(e) = self.store.borrow_mut().backup(Cat::Tc) {
                log::error!("credential backup failed: {}", e);
            }

            let _ = self.events.send(SysEvent::CupsDelay).await;
        }

        let hello = json!({
            "msgtype": "version",
            "station": STATION_VERSION,
            "firmware": STATION_VERSION,
            "package": STATION_PACKAGE,
            "model": STATION_MODEL,
            "protocol": PROTOCOL_VERSION,
            "features": STATION_FEATURES,
        });

        if ws.send(Message::text(hello.to_string())).await.is_err() {
            return SessionEnd::Err(TcErr::Closed, true);
        }

        self.muxs_session(&mut ws).await
    }

    /// Open the INFOS WebSocket, ask which MUXS serves us, close cleanly.
    async fn infos_exchange(&mut self) -> Result<String, SessionEnd> {
        let base = match self.store.borrow_mut().uri(Cat::Tc, self.credset) {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                log::error!("no TC URI for {:?}", self.credset);

                return Err(SessionEnd::Err(TcErr::NoUri, false));
            }
            Err(e) => {
                log::error!("cannot read TC URI: {}", e);

                return Err(SessionEnd::Err(TcErr::NoUri, false));
            }
        };

        let uri = format!("{}/router-info", base.trim_end_matches('/'));

        let mut ws = match self.connect(&uri).await {
            Ok(ws) => ws,
            Err(err) => return Err(SessionEnd::Err(err, false)),
        };

        self.set_state(TcState::InfosReqPend);

        let request = json!({ "router": self.eui.to_string() }).to_string();

        if ws.send(Message::text(request)).await.is_err() {
            return Err(SessionEnd::Err(TcErr::Failed, false));
        }

        // Exactly one JSON text reply.
        let reply = loop {
            match timeout(CONNECT_TIMEOUT, ws.next()).await {
                Err(_) => return Err(SessionEnd::Err(TcErr::Timeout, false)),
                Ok(None) => return Err(SessionEnd::Err(TcErr::Failed, false)),
                Ok(Some(Ok(Message::Text(text)))) => break text,
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(_))) => return Err(SessionEnd::Err(TcErr::Rejected, false)),
                Ok(Some(Err(e))) => {
                    log::warn!("INFOS socket error: {}", e);

                    return Err(SessionEnd::Err(TcErr::Failed, false));
                }
            }
        };

        let uri = parse_infos(reply.as_str()).map_err(|e| SessionEnd::Err(e, false))?;

        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;

        Ok(uri)
    }

    async fn connect(&mut self, uri: &str) -> Result<Ws, TcErr> {
        let connector = match tls::client_config(&mut self.store.borrow_mut(), Cat::Tc, self.credset)
        {
            Ok(Some(config)) => Some(Connector::Rustls(config)),
            Ok(None) => None,
            Err(e) => {
                log::error!("TLS setup failed: {}", e);

                return Err(TcErr::Failed);
            }
        };

        match timeout(
            CONNECT_TIMEOUT,
            connect_async_tls_with_config(uri, None, true, connector),
        )
        .await
        {
            Err(_) => {
                log::warn!("connect to {} timed out", uri);

                Err(TcErr::Timeout)
            }
            Ok(Err(e)) => {
                log::warn!("connect to {} failed: {}", uri, e);

                Err(TcErr::Failed)
            }
            Ok(Ok((ws, _response))) => Ok(ws),
        }
    }

    /// The operational phase: stream uplinks, execute downlinks, keep time.
    async fn muxs_session(&mut self, ws: &mut Ws) -> SessionEnd {
        let mut next_timesync = Instant::now() + Duration::from_secs(2);

        loop {
            // Drain whatever is flushable before suspending.
            if let Err(end) = self.flush_rxjobs(ws).await {
                return end;
            }

            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        None => return SessionEnd::Err(TcErr::Closed, true),

                        Some(Err(e)) => {
                            log::warn!("MUXS socket error: {}", e);

                            return SessionEnd::Err(TcErr::Closed, true);
                        }

                        Some(Ok(Message::Close(frame))) => {
                            log::warn!("MUXS closed: {:?}", frame);

                            return SessionEnd::Err(TcErr::Closed, true);
                        }

                        Some(Ok(Message::Text(text))) => {
                            match self.s2e.on_msg(text.as_str()) {
                                Ok(actions) => {
                                    for action in actions {
                                        self.perform(ws, action).await;
                                    }
                                }
                                Err(e) => {
                                    log::error!("unusable MUXS frame: {}", e);

                                    return self.fail_session(ws).await;
                                }
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            match self.s2e.on_binary(&data) {
                                Ok(actions) => {
                                    for action in actions {
                                        self.perform(ws, action).await;
                                    }
                                }
                                Err(e) => {
                                    log::error!("unusable MUXS binary frame: {}", e);

                                    return self.fail_session(ws).await;
                                }
                            }
                        }

                        Some(Ok(_)) => {}
                    }
                }

                job = self.uplinks.recv() => {
                    match job {
                        None => return SessionEnd::Exit,
                        Some(job) => {
                            if !self.s2e.queue.try_add(job) {
                                log::error!("uplink ring full, frame dropped");
                            }
                        }
                    }
                }

                _ = sleep_until(next_timesync) => {
                    next_timesync = Instant::now() + TIMESYNC_PERIOD;

                    let txtime = ustime_now();
                    self.pending_timesync = Some(txtime);

                    let msg = self.s2e.encode_timesync(txtime);

                    if ws.send(Message::text(msg)).await.is_err() {
                        return SessionEnd::Err(TcErr::Closed, true);
                    }
                }

                ctl = self.ctl.recv() => {
                    let ctl = ctl.unwrap_or(TcCtl::Stop);

                    let _ = ws.close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })).await;

                    return SessionEnd::Ctl(ctl);
                }
            }
        }
    }

    /// Handler error: clean close with code 1000, then ERR_FAILED.
    async fn fail_session(&mut self, ws: &mut Ws) -> SessionEnd {
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;

        SessionEnd::Err(TcErr::Failed, true)
    }

    /// Stream queued uplinks. Backpressure keeps jobs in the ring; a dead
    /// socket surfaces as a session error.
    async fn flush_rxjobs(&mut self, ws: &mut Ws) -> Result<(), SessionEnd> {
        while let Some(job) = self.s2e.queue.pop() {
            let gpstime = self.timesync.borrow().xtime_to_gpstime(job.xtime).ok();

            let Some(text) = self.s2e.encode_updf(&job, gpstime) else {
                log::warn!("uplink with unmappable {:?} dropped", job.rps);

                continue;
            };

            if let Err(e) = ws.send(Message::text(text)).await {
                log::warn!("uplink send failed: {}", e);

                self.s2e.queue.unpop(job);

                return Err(SessionEnd::Err(TcErr::Closed, true));
            }
        }

        Ok(())
    }

    async fn perform(&mut self, ws: &mut Ws, action: S2eAction) {
        match action {
            S2eAction::Transmit { diid, job } => {
                let rctx = job.rctx;
                let xtime = job.xtime;

                match self.ral.tx(job).await {
                    TxResult::Ok => {
                        let gpstime = self.timesync.borrow().xtime_to_gpstime(xtime).ok();

                        let msg = self.s2e.encode_dntxed(diid, rctx, xtime, gpstime);

                        if let Err(e) = ws.send(Message::text(msg)).await {
                            log::warn!("dntxed send failed: {}", e);
                        }
                    }
                    TxResult::NoCa => {
                        log::warn!("dnmsg diid={} blocked by channel-clear assessment", diid);
                    }
                    TxResult::Fail => {
                        log::warn!("dnmsg diid={} failed", diid);
                    }
                }
            }

            S2eAction::Timesync { txtime, gpstime } => {
                let rxtime = ustime_now();

                let mut ts = self.timesync.borrow_mut();

                match (txtime, self.pending_timesync.take()) {
                    (Some(echo), Some(pending)) if echo == pending => {
                        // Strict anchoring against the tracked PPS grid when
                        // possible, otherwise take the midpoint on faith.
                        match ts.gps_anchor_strict(pending, rxtime, gpstime) {
                            Ok(true) => {}
                            Ok(false) => log::debug!("strict GPS anchor inconclusive"),
                            Err(_) => ts.gps_anchor_fuzzy(pending, rxtime, gpstime),
                        }
                    }
                    (Some(echo), pending) => {
                        log::debug!(
                            "timesync echo {} does not match pending {:?}",
                            echo,
                            pending
                        );
                    }
                    (None, _) => {
                        // Server-initiated: fuzzy only, the roundtrip window
                        // is unknown.
                        ts.gps_anchor_fuzzy(rxtime, rxtime, gpstime);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn infos_reply_parses() {
        let uri = parse_infos(
            r#"{"router":"1-2-3-4-5-6-7-8","muxs":"mx-0","uri":"wss://mux.example:443/ws"}"#,
        )
        .unwrap();

        assert_eq!(uri, "wss://mux.example:443/ws");
    }

    #[test]
    fn infos_error_field_rejects() {
        assert_eq!(
            parse_infos(r#"{"router":"1-2-3-4-5-6-7-8","error":"unknown router"}"#),
            Err(TcErr::Rejected)
        );
    }

    #[test]
    fn infos_missing_or_bogus_uri_rejects() {
        assert_eq!(parse_infos(r#"{"router":"::0"}"#), Err(TcErr::Rejected));
        assert_eq!(
            parse_infos(r#"{"uri":"https://not-a-socket.example"}"#),
            Err(TcErr::Rejected)
        );
        assert_eq!(parse_infos("not json"), Err(TcErr::Rejected));
    }

    #[test]
    fn policy_hands_over_to_cups() {
        assert_eq!(
            next_step(TcErr::Rejected, 0, false, true),
            NextStep::TriggerCups
        );
        assert_eq!(next_step(TcErr::NoUri, 0, false, true), NextStep::TriggerCups);
        assert_eq!(
            next_step(TcErr::Failed, MAX_RETRIES, true, true),
            NextStep::TriggerCups
        );

        // Without CUPS the same failures fall back to INFOS rediscovery.
        assert_eq!(
            next_step(TcErr::Rejected, 0, false, false),
            NextStep::InfosBackoff(Duration::from_secs(10))
        );
    }

    #[test]
    fn clean_close_gets_fast_muxs_reconnect() {
        // Scenario: first flap from a fresh session -> 1 s backoff.
        assert_eq!(
            next_step(TcErr::Closed, 0, true, true),
            NextStep::MuxsBackoff(Duration::from_secs(1))
        );

        // Delay doubles per retry.
        assert_eq!(
            next_step(TcErr::Closed, 3, true, true),
            NextStep::MuxsBackoff(Duration::from_secs(8))
        );

        // Beyond the fast window it degrades to INFOS rediscovery.
        assert_eq!(
            next_step(TcErr::Closed, MAX_FAST_RETRIES + 1, true, true),
            NextStep::InfosBackoff(Duration::from_secs(50))
        );

        // A close without a cached URI cannot shortcut.
        assert_eq!(
            next_step(TcErr::Closed, 0, false, true),
            NextStep::InfosBackoff(Duration::from_secs(10))
        );
    }

    #[test]
    fn infos_backoff_delay_is_capped() {
        assert_eq!(
            next_step(TcErr::Failed, 2, false, true),
            NextStep::InfosBackoff(Duration::from_secs(20))
        );
        assert_eq!(
            next_step(TcErr::Failed, 9, false, true),
            NextStep::InfosBackoff(Duration::from_secs(60))
        );
    }

    #[test]
    fn state_codes_sign_convention() {
        assert!(TcState::MuxsConnected.code() >= 0);
        assert!(TcState::InfosBackoff.code() >= 0);
        assert!(TcState::Error(TcErr::Rejected).code() < 0);
        assert!(TcState::Error(TcErr::Closed).code() < 0);
    }
}
