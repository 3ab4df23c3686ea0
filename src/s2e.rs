//! Boundary to the LNS message codec.
//!
//! Full LoRaWAN MAC-frame parsing is a library concern outside this crate; the
//! TC engine only needs enough of the codec to stream uplinks out, turn
//! `dnmsg` downlink jobs into [`TxJob`]s, and feed LNS `timesync` exchanges
//! into the clock machinery. Frames ride through as opaque hex.

use crate::config::Eui;
use crate::error::Error;
use crate::ral::{RxJob, Rps, TxJob};
use crate::timesync::{Gpstime, Ustime, Xtime};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;

/// Capacity of the TC uplink ring. A full ring drops, it never blocks.
pub const MAX_RXJOBS: usize = 64;

/// Uplink data-rate table for one regulatory region.
#[derive(Debug, Clone)]
pub struct DrTable {
    up: Vec<Rps>,
}

impl DrTable {
    /// The EU868 table: DR0..DR5 are SF12..SF7 at 125 kHz, DR6 is SF7 at
    /// 250 kHz and DR7 is FSK.
    pub fn eu868() -> Self {
        let mut up: Vec<Rps> = (0..6).map(|dr| Rps::lora(12 - dr, 125_000)).collect();

        up.push(Rps::lora(7, 250_000));
        up.push(Rps::fsk());

        Self { up }
    }

    /// Pick the table for a region code. Region `0` behaves like EU868 minus
    /// LBT, which does not affect data rates.
    pub fn for_region(_region: u16) -> Self {
        Self::eu868()
    }

    /// Map radio parameters to an uplink DR. `None` when the parameters exist
    /// in no table row; such frames are not forwardable.
    pub fn rps_to_dr(&self, rps: Rps) -> Option<u8> {
        self.up
            .iter()
            .position(|r| *r == rps)
            .map(|dr| dr as u8)
    }

    /// Map an uplink DR back to radio parameters.
    pub fn dr_to_rps(&self, dr: u8) -> Option<Rps> {
        self.up.get(usize::from(dr)).copied()
    }
}

/// The uplink ring between the RAL and the TC send path.
#[derive(Debug)]
pub struct RxQueue {
    jobs: VecDeque<RxJob>,
    cap: usize,
}

impl RxQueue {
    /// A ring holding at most `cap` jobs.
    pub fn new(cap: usize) -> Self {
        Self {
            jobs: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Enqueue a job; returns `false` (dropping the job) when no slot is
    /// available.
    pub fn try_add(&mut self, job: RxJob) -> bool {
        if self.jobs.len() >= self.cap {
            return false;
        }

        self.jobs.push_back(job);

        true
    }

    /// Next job to flush, front of the ring.
    pub fn pop(&mut self) -> Option<RxJob> {
        self.jobs.pop_front()
    }

    /// Put a job back at the front after a failed send.
    pub fn unpop(&mut self, job: RxJob) {
        self.jobs.push_front(job);
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// What the TC engine should do in reaction to a downlink frame.
#[derive(Debug, Clone, PartialEq)]
pub enum S2eAction {
    /// Schedule a transmission and confirm with `dntxed` on success.
    Transmit {
        /// Downlink id echoed in the confirmation.
        diid: i64,
        /// The job.
        job: TxJob,
    },
    /// Feed an LNS time exchange into timesync.
    Timesync {
        /// Station `ustime` echoed from our request, if this answers one.
        txtime: Option<Ustime>,
        /// LNS GPS time, microseconds.
        gpstime: Gpstime,
    },
}

#[derive(Debug, Deserialize)]
struct DnmsgWire {
    #[serde(default)]
    diid: i64,
    #[serde(rename = "DR")]
    dr: u8,
    #[serde(rename = "Freq")]
    freq: u32,
    xtime: i64,
    #[serde(default)]
    rctx: i64,
    pdu: String,
    #[serde(default)]
    priority: i64,
    #[serde(rename = "txpow", default = "default_txpow")]
    txpow: i8,
}

fn default_txpow() -> i8 {
    14
}

#[derive(Debug, Deserialize)]
struct TimesyncWire {
    #[serde(default)]
    txtime: Option<i64>,
    gpstime: i64,
}

#[derive(Debug, Deserialize)]
struct MsgType {
    msgtype: String,
}

/// Codec state for one MUXS session.
#[derive(Debug)]
pub struct S2e {
    router: Eui,
    dn: DrTable,
    /// Uplink ring; jobs live here until flushed to the LNS.
    pub queue: RxQueue,
}

impl S2e {
    /// Fresh codec state.
    pub fn new(router: Eui, region: u16) -> Self {
        Self {
            router,
            dn: DrTable::for_region(region),
            queue: RxQueue::new(MAX_RXJOBS),
        }
    }

    /// The gateway identity frames are encoded for.
    pub fn router(&self) -> Eui {
        self.router
    }

    /// Handle one text frame from the MUXS connection.
    ///
    /// An `Err` means the frame was unusable enough that the session should be
    /// torn down; unknown message types are skipped with a log line only.
    pub fn on_msg(&mut self, text: &str) -> Result<Vec<S2eAction>, Error> {
        let head: MsgType = serde_json::from_str(text)?;

        match head.msgtype.as_str() {
            "dnmsg" => {
                let wire: DnmsgWire = serde_json::from_str(text)?;

                let Some(rps) = self.dn.dr_to_rps(wire.dr) else {
                    log::warn!("dnmsg diid={} with unknown DR{}", wire.diid, wire.dr);

                    return Ok(Vec::new());
                };

                let Some(payload) = hex_decode(&wire.pdu) else {
                    log::warn!("dnmsg diid={} with unparseable pdu", wire.diid);

                    return Ok(Vec::new());
                };

                let Ok(payload) = heapless::Vec::from_slice(&payload) else {
                    log::warn!(
                        "dnmsg diid={} with oversized pdu of {} bytes",
                        wire.diid,
                        payload.len()
                    );

                    return Ok(Vec::new());
                };

                let txunit = crate::timesync::xtime::txunit(wire.xtime);

                log::debug!(
                    "dnmsg diid={} DR{} {} Hz prio={} -> txunit {}",
                    wire.diid,
                    wire.dr,
                    wire.freq,
                    wire.priority,
                    txunit
                );

                Ok(vec![S2eAction::Transmit {
                    diid: wire.diid,
                    job: TxJob {
                        txunit,
                        rctx: wire.rctx,
                        rps,
                        xtime: wire.xtime,
                        freq: wire.freq,
                        txpow: wire.txpow,
                        addcrc: false,
                        payload,
                    },
                }])
            }

            "timesync" => {
                let wire: TimesyncWire = serde_json::from_str(text)?;

                Ok(vec![S2eAction::Timesync {
                    txtime: wire.txtime,
                    gpstime: wire.gpstime,
                }])
            }

            other => {
                log::debug!("ignoring LNS message type `{}`", other);

                Ok(Vec::new())
            }
        }
    }

    /// Handle one binary frame. Opaque to this codec.
    pub fn on_binary(&mut self, data: &[u8]) -> Result<Vec<S2eAction>, Error> {
        log::debug!("ignoring {} byte binary LNS frame", data.len());

        Ok(Vec::new())
    }

    /// Whether a received frame's parameters map onto an uplink data rate.
    pub fn uplink_dr(&self, rps: Rps) -> Option<u8> {
        self.dn.rps_to_dr(rps)
    }

    /// Encode an uplink frame for the LNS.
    ///
    /// The MAC payload rides through opaquely; parsed MAC fields are the
    /// upstream codec's business.
    pub fn encode_updf(&self, job: &RxJob, gpstime: Option<Gpstime>) -> Option<String> {
        let dr = self.uplink_dr(job.rps)?;

        Some(
            json!({
                "msgtype": "updf",
                "DR": dr,
                "Freq": job.freq,
                "frame": hex_encode(&job.payload),
                "upinfo": {
                    "rctx": job.rctx,
                    "xtime": job.xtime,
                    "gpstime": gpstime.unwrap_or(0),
                    "rssi": job.rssi,
                    "snr": job.snr,
                },
            })
            .to_string(),
        )
    }

    /// Encode the transmission confirmation for a downlink.
    pub fn encode_dntxed(&self, diid: i64, rctx: i64, xtime: Xtime, gpstime: Option<Gpstime>) -> String {
        json!({
            "msgtype": "dntxed",
            "diid": diid,
            "rctx": rctx,
            "xtime": xtime,
            "gpstime": gpstime.unwrap_or(0),
        })
        .to_string()
    }

    /// Encode a station-initiated time exchange request.
    pub fn encode_timesync(&self, txtime: Ustime) -> String {
        json!({
            "msgtype": "timesync",
            "txtime": txtime,
        })
        .to_string()
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode a hex string; `None` on odd length or stray characters.
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    let s = s.as_bytes();

    if s.len() % 2 != 0 {
        return None;
    }

    s.chunks_exact(2)
        .map(|pair| Some(hex_val(pair[0])? << 4 | hex_val(pair[1])?))
        .collect()
}

/// Encode bytes as lowercase hex.
pub fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);

    for b in data {
        out.push_str(&format!("{:02x}", b));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::xtime;
    use pretty_assertions::assert_eq;

    fn s2e() -> S2e {
        S2e::new(Eui(0x0102030405060708), 868)
    }

    #[test]
    fn eu868_dr_table() {
        let t = DrTable::eu868();

        assert_eq!(t.dr_to_rps(0), Some(Rps::lora(12, 125_000)));
        assert_eq!(t.dr_to_rps(5), Some(Rps::lora(7, 125_000)));
        assert_eq!(t.dr_to_rps(6), Some(Rps::lora(7, 250_000)));
        assert_eq!(t.dr_to_rps(7), Some(Rps::fsk()));
        assert_eq!(t.dr_to_rps(8), None);

        assert_eq!(t.rps_to_dr(Rps::lora(9, 125_000)), Some(3));
        assert_eq!(t.rps_to_dr(Rps::lora(9, 500_000)), None);
    }

    #[test]
    fn dnmsg_decodes_to_txjob() {
        let mut s2e = s2e();

        let x = xtime::mk(2, 0x5a, 1_000_000);

        let text = format!(
            r#"{{"msgtype":"dnmsg","diid":77,"DR":5,"Freq":869525000,"xtime":{},"rctx":2,"pdu":"60aabbccdd"}}"#,
            x
        );

        let actions = s2e.on_msg(&text).unwrap();

        let S2eAction::Transmit { diid, job } = &actions[0] else {
            panic!("expected transmit action");
        };

        assert_eq!(*diid, 77);
        assert_eq!(job.txunit, 2);
        assert_eq!(job.rps, Rps::lora(7, 125_000));
        assert_eq!(job.freq, 869_525_000);
        assert_eq!(job.payload.as_slice(), &[0x60, 0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn unknown_msgtype_is_skipped() {
        let mut s2e = s2e();

        assert_eq!(s2e.on_msg(r#"{"msgtype":"rmtsh","x":1}"#).unwrap(), Vec::new());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut s2e = s2e();

        assert!(s2e.on_msg("{nope").is_err());
    }

    #[test]
    fn timesync_answer_carries_txtime() {
        let mut s2e = s2e();

        let actions = s2e
            .on_msg(r#"{"msgtype":"timesync","txtime":123456,"gpstime":1400000000000000}"#)
            .unwrap();

        assert_eq!(
            actions,
            vec![S2eAction::Timesync {
                txtime: Some(123_456),
                gpstime: 1_400_000_000_000_000,
            }]
        );
    }

    #[test]
    fn rxqueue_drops_on_full() {
        let mut q = RxQueue::new(2);

        let job = RxJob {
            rctx: 0,
            xtime: 1,
            freq: 868_100_000,
            rps: Rps::lora(7, 125_000),
            rssi: -50.0,
            snr: 9.0,
            payload: heapless::Vec::new(),
        };

        assert!(q.try_add(job.clone()));
        assert!(q.try_add(job.clone()));
        assert!(!q.try_add(job));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn updf_rejects_unmappable_rps() {
        let s2e = s2e();

        let job = RxJob {
            rctx: 0,
            xtime: 1,
            freq: 868_100_000,
            rps: Rps::lora(9, 500_000),
            rssi: -50.0,
            snr: 9.0,
            payload: heapless::Vec::from_slice(&[1, 2, 3]).unwrap(),
        };

        assert_eq!(s2e.encode_updf(&job, None), None);

        let ok = RxJob {
            rps: Rps::lora(7, 125_000),
            ..job
        };

        let text = s2e.encode_updf(&ok, None).unwrap();

        assert!(text.contains(r#""msgtype":"updf""#));
        assert!(text.contains(r#""frame":"010203""#));
        assert!(text.contains(r#""DR":5"#));
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!(hex_decode("0aFF10"), Some(vec![0x0a, 0xff, 0x10]));
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
        assert_eq!(hex_encode(&[0x0a, 0xff, 0x10]), "0aff10");
    }
}
