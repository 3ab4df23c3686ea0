//! Radio abstraction layer.
//!
//! The master process exposes a uniform TX/RX/timesync API over N concentrator
//! chips. Each chip is owned by a dedicated slave process ([`slave`]) which the
//! master ([`master`]) spawns, configures and respawns on failure. The two
//! sides talk over a pair of non-blocking pipes carrying the records defined in
//! [`msg`].

pub mod master;
pub mod msg;
pub mod slave;

use crate::error::RalError;
use crate::timesync::Xtime;
use heapless::Vec as HVec;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

/// How long a synchronous TX/TXSTATUS round trip may take before the master
/// gives up and returns a safe default (five 500 µs polls).
pub(crate) const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_micros(5 * 500);

/// Radio parameter set: spreading factor, bandwidth and the beacon flag packed
/// into 16 bits.
///
/// ```text
/// bits 0..3: spreading factor, 7..=12 for LoRa, 0 for FSK
/// bits 4..5: bandwidth code, 0 = 125 kHz, 1 = 250 kHz, 2 = 500 kHz
/// bit  6   : beacon flag
/// ```
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Rps(u16);

impl Rps {
    /// An unusable RPS, used to reject unmappable modulation parameters.
    pub const ILLEGAL: Rps = Rps(0xffff);

    const BEACON: u16 = 1 << 6;

    /// A LoRa parameter set. `bw` is in Hz.
    pub fn lora(sf: u8, bw: u32) -> Self {
        debug_assert!((7..=12).contains(&sf));

        let bw_code = match bw {
            125_000 => 0,
            250_000 => 1,
            500_000 => 2,
            _ => return Self::ILLEGAL,
        };

        Self(u16::from(sf) | (bw_code << 4))
    }

    /// The FSK parameter set.
    pub fn fsk() -> Self {
        Self(0)
    }

    /// Rebuild from the packed representation.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The packed representation.
    pub fn to_raw(self) -> u16 {
        self.0
    }

    /// `true` for FSK parameter sets.
    pub fn is_fsk(self) -> bool {
        self != Self::ILLEGAL && self.0 & 0x0f == 0
    }

    /// Spreading factor, `None` for FSK.
    pub fn sf(self) -> Option<u8> {
        match (self.0 & 0x0f) as u8 {
            0 => None,
            sf => Some(sf),
        }
    }

    /// Bandwidth in Hz.
    pub fn bw(self) -> u32 {
        match (self.0 >> 4) & 0x03 {
            0 => 125_000,
            1 => 250_000,
            _ => 500_000,
        }
    }

    /// Mark this parameter set as a Class B beacon transmission.
    pub fn with_beacon(self) -> Self {
        Self(self.0 | Self::BEACON)
    }

    /// `true` if the beacon flag is set.
    pub fn is_beacon(self) -> bool {
        self.0 & Self::BEACON != 0
    }
}

impl core::fmt::Debug for Rps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self == Self::ILLEGAL {
            return f.write_str("Rps(ILLEGAL)");
        }

        match self.sf() {
            Some(sf) => write!(f, "SF{}/BW{}", sf, self.bw() / 1000)?,
            None => write!(f, "FSK")?,
        }

        if self.is_beacon() {
            f.write_str("/BCN")?;
        }

        Ok(())
    }
}

/// Which antenna a chip is wired to.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntennaType {
    /// Unknown wiring.
    #[default]
    Undefined,
    /// Omnidirectional: downlinks may be replicated onto any other omni unit.
    Omni,
    /// Sector antenna.
    Sector,
}

/// A pending downlink transmission.
///
/// Owned by the caller until handed to the RAL; the RAL copies the payload
/// into the pipe record.
#[derive(Debug, Clone, PartialEq)]
pub struct TxJob {
    /// Destination concentrator.
    pub txunit: u8,
    /// Opaque routing context echoed back to the LNS.
    pub rctx: i64,
    /// Radio parameters.
    pub rps: Rps,
    /// Absolute emission time in the destination chip's time base.
    pub xtime: Xtime,
    /// Centre frequency, Hz.
    pub freq: u32,
    /// TX power, dBm.
    pub txpow: i8,
    /// Append a payload CRC on air.
    pub addcrc: bool,
    /// Frame bytes.
    pub payload: HVec<u8, { crate::MAX_FRAME_LEN }>,
}

/// A received uplink frame on its way to the LNS.
#[derive(Debug, Clone, PartialEq)]
pub struct RxJob {
    /// Routing context: the originating txunit in the high bits.
    pub rctx: i64,
    /// Reception time in the originating chip's time base.
    pub xtime: Xtime,
    /// Centre frequency, Hz.
    pub freq: u32,
    /// Radio parameters.
    pub rps: Rps,
    /// Received signal strength, dBm.
    pub rssi: f32,
    /// Signal to noise ratio, dB.
    pub snr: f32,
    /// Frame bytes.
    pub payload: HVec<u8, { crate::MAX_FRAME_LEN }>,
}

/// Outcome of a TX submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxResult {
    /// Queued on the concentrator.
    Ok,
    /// Rejected by the HAL or the slave is unreachable.
    Fail,
    /// Channel-clear assessment found the channel busy.
    NoCa,
}

/// State of a previously submitted TX job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// Nothing queued (or the slave is unreachable).
    Idle,
    /// Queued for a future instant.
    Scheduled,
    /// On air.
    Emitting,
}

/// Requests a [`Ral`] sends to one slave supervisor task.
#[derive(Debug)]
pub(crate) enum SupRequest {
    Tx {
        job: TxJob,
        nocca: bool,
        reply: oneshot::Sender<TxResult>,
    },
    TxStatus {
        rctx: i64,
        reply: oneshot::Sender<TxStatus>,
    },
    TxAbort {
        rctx: i64,
    },
}

/// Handle to one supervised slave.
#[derive(Debug, Clone)]
pub(crate) struct SlaveHandle {
    pub(crate) requests: mpsc::Sender<SupRequest>,
    pub(crate) antenna: AntennaType,
    /// Cleared while the slave's pipes are down (between death and respawn).
    pub(crate) usable: Arc<AtomicBool>,
}

/// The uniform RAL API handed to the rest of the core.
#[derive(Debug, Clone)]
pub struct Ral {
    slaves: Vec<SlaveHandle>,
}

impl Ral {
    pub(crate) fn new(slaves: Vec<SlaveHandle>) -> Self {
        Self { slaves }
    }

    /// A handle with no slaves behind it: every TX operation returns its safe
    /// default. Useful for tools and tests that exercise the transport side
    /// without radio hardware.
    pub fn offline() -> Self {
        Self::new(Vec::new())
    }

    /// Number of configured txunits.
    pub fn txunits(&self) -> usize {
        self.slaves.len()
    }

    /// Submit a downlink for transmission.
    ///
    /// Returns [`TxResult::Fail`] if the slave does not answer within the
    /// bounded round-trip window; a response arriving later is discarded as
    /// stale by the supervisor.
    pub async fn tx(&self, job: TxJob) -> TxResult {
        self.tx_inner(job, false).await
    }

    /// Submit a downlink, requesting that channel-clear assessment be skipped.
    ///
    /// The current HAL cannot actually bypass CCA; behaviour matches
    /// [`Ral::tx`]. The distinction is kept at the interface for HALs that can.
    pub async fn tx_nocca(&self, job: TxJob) -> TxResult {
        self.tx_inner(job, true).await
    }

    async fn tx_inner(&self, job: TxJob, nocca: bool) -> TxResult {
        let Ok(slave) = self.txunit_to_slave(job.txunit, "TX") else {
            return TxResult::Fail;
        };

        let (reply_tx, reply_rx) = oneshot::channel();

        let req = SupRequest::Tx {
            job,
            nocca,
            reply: reply_tx,
        };

        if slave.requests.send(req).await.is_err() {
            return TxResult::Fail;
        }

        match timeout(SYNC_REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            _ => TxResult::Fail,
        }
    }

    /// Query the state of a previously submitted TX job.
    pub async fn tx_status(&self, txunit: u8, rctx: i64) -> TxStatus {
        let Ok(slave) = self.txunit_to_slave(txunit, "TXSTATUS") else {
            return TxStatus::Idle;
        };

        let (reply_tx, reply_rx) = oneshot::channel();

        if slave
            .requests
            .send(SupRequest::TxStatus {
                rctx,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return TxStatus::Idle;
        }

        match timeout(SYNC_REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(status)) => status,
            _ => TxStatus::Idle,
        }
    }

    /// Cancel a scheduled transmission. Fire and forget.
    pub fn tx_abort(&self, txunit: u8, rctx: i64) {
        let Ok(slave) = self.txunit_to_slave(txunit, "TXABORT") else {
            return;
        };

        let _ = slave.requests.try_send(SupRequest::TxAbort { rctx });
    }

    /// Bitmap of *other* txunits with an omnidirectional antenna, onto which a
    /// downlink for `txunit` may be replicated.
    pub fn alt_antennas(&self, txunit: u8) -> u8 {
        if usize::from(txunit) >= self.slaves.len()
            || self.slaves[usize::from(txunit)].antenna != AntennaType::Omni
        {
            return 0;
        }

        let mut map = 0u8;

        for (i, slave) in self.slaves.iter().enumerate() {
            if i != usize::from(txunit) && slave.antenna == AntennaType::Omni {
                map |= 1 << i;
            }
        }

        map
    }

    fn txunit_to_slave(&self, txunit: u8, op: &str) -> Result<&SlaveHandle, RalError> {
        let slave = self
            .slaves
            .get(usize::from(txunit))
            .filter(|s| s.usable.load(Ordering::Relaxed))
            .ok_or(RalError::NoSuchTxUnit { txunit })?;

        if slave.requests.is_closed() {
            log::warn!("{} for txunit {} dropped: supervisor gone", op, txunit);

            return Err(RalError::NoSuchTxUnit { txunit });
        }

        Ok(slave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rps_packs_and_unpacks() {
        let rps = Rps::lora(12, 125_000);

        assert_eq!(rps.sf(), Some(12));
        assert_eq!(rps.bw(), 125_000);
        assert!(!rps.is_fsk());
        assert!(!rps.is_beacon());

        let bcn = Rps::lora(9, 125_000).with_beacon();
        assert!(bcn.is_beacon());
        assert_eq!(bcn.sf(), Some(9));

        assert!(Rps::fsk().is_fsk());
        assert_eq!(Rps::fsk().sf(), None);

        assert_eq!(Rps::lora(7, 300_000), Rps::ILLEGAL);
    }

    #[test]
    fn rps_raw_roundtrip() {
        for rps in [Rps::lora(8, 500_000).with_beacon(), Rps::fsk(), Rps::lora(10, 250_000)] {
            assert_eq!(Rps::from_raw(rps.to_raw()), rps);
        }
    }

    #[test]
    fn alt_antennas_only_pairs_omnis() {
        let mk = |antenna| SlaveHandle {
            requests: mpsc::channel(1).0,
            antenna,
            usable: Arc::new(AtomicBool::new(true)),
        };

        let ral = Ral::new(vec![
            mk(AntennaType::Omni),
            mk(AntennaType::Sector),
            mk(AntennaType::Omni),
        ]);

        assert_eq!(ral.alt_antennas(0), 0b100);
        assert_eq!(ral.alt_antennas(1), 0);
        assert_eq!(ral.alt_antennas(2), 0b001);
        assert_eq!(ral.alt_antennas(7), 0);
    }
}
