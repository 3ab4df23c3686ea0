//! Pipe records exchanged between the RAL master and its slaves.
//!
//! Every record is `[code: u8][len: u16 LE][body: len bytes]` and must fit in
//! `PIPE_BUF` so a single `write(2)` is atomic. The reader side still has to
//! reassemble: one `read(2)` may return several records, and the kernel buffer
//! boundary may split a record in half.

use crate::error::{Error, RalError};
use crate::ral::{RxJob, Rps, TxJob, TxResult, TxStatus};
use crate::timesync::Measurement;
use heapless::Vec as HVec;
use lorastation_wire::{WireCursor, WireError, WireWriter};

/// Record header: code byte plus 16-bit body length.
pub const HEADER_LEN: usize = 3;

pub const CONFIG: u8 = 0x01;
pub const TX: u8 = 0x02;
pub const TX_NOCCA: u8 = 0x03;
pub const TXSTATUS: u8 = 0x04;
pub const TXABORT: u8 = 0x05;
pub const TIMESYNC: u8 = 0x06;
pub const STOP: u8 = 0x07;

pub const RESPONSE: u8 = 0x81;
pub const RESPONSE_TIMESYNC: u8 = 0x82;
pub const RX_RESPONSE: u8 = 0x83;

/// Status byte of a [`Msg::Response`] answering `TX`/`TX_NOCCA`.
pub const STATUS_TX_OK: u8 = 0;
pub const STATUS_TX_FAIL: u8 = 1;
pub const STATUS_TX_NOCA: u8 = 2;

/// Status byte of a [`Msg::Response`] answering `TXSTATUS`.
pub const STATUS_IDLE: u8 = 0;
pub const STATUS_SCHEDULED: u8 = 1;
pub const STATUS_EMITTING: u8 = 2;

/// Chip configuration pushed to a slave.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMsg {
    /// Regulatory region code; `0` disables LBT gating of TX responses.
    pub region: u16,
    /// Uplink channels this chip serves.
    pub upchannels: Vec<(u32, Rps)>,
    /// The chip's `slave-<i>.conf` JSON, passed through verbatim.
    pub hwconf: Vec<u8>,
}

/// A decoded pipe record.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// Configure the chip and start the HAL.
    Config(ConfigMsg),
    /// Transmit. `nocca` requests skipping channel-clear assessment.
    Tx {
        /// Skip CCA. The current HAL cannot honour this; behaviour is
        /// identical to a plain transmit.
        nocca: bool,
        /// Routing context echoed in responses.
        rctx: i64,
        /// Radio parameters.
        rps: Rps,
        /// Absolute emission time.
        xtime: i64,
        /// Centre frequency, Hz.
        freq: u32,
        /// TX power, dBm.
        txpow: i8,
        /// Append payload CRC on air.
        addcrc: bool,
        /// Frame bytes.
        payload: HVec<u8, { crate::MAX_FRAME_LEN }>,
    },
    /// Query the TX path state.
    TxStatus {
        /// Routing context of the job queried.
        rctx: i64,
    },
    /// Cancel a scheduled transmission. No reply.
    TxAbort {
        /// Routing context of the job to cancel.
        rctx: i64,
    },
    /// Request a timesync measurement.
    Timesync,
    /// Stop the HAL and RX polling.
    Stop,
    /// Slave answer to `TX`/`TX_NOCCA`/`TXSTATUS`.
    Response {
        /// Command code this answers.
        to_code: u8,
        /// Status byte, namespaced by `to_code`.
        status: u8,
    },
    /// Slave answer to `TIMESYNC`.
    TimesyncRsp {
        /// Round-trip duration of the measurement, microseconds.
        quality: i64,
        /// The measurement itself.
        meas: Measurement,
    },
    /// An uplink frame.
    Rx(RxJob),
}

impl Msg {
    /// Command code of this record.
    pub fn code(&self) -> u8 {
        match self {
            Msg::Config(_) => CONFIG,
            Msg::Tx { nocca: false, .. } => TX,
            Msg::Tx { nocca: true, .. } => TX_NOCCA,
            Msg::TxStatus { .. } => TXSTATUS,
            Msg::TxAbort { .. } => TXABORT,
            Msg::Timesync => TIMESYNC,
            Msg::Stop => STOP,
            Msg::Response { .. } => RESPONSE,
            Msg::TimesyncRsp { .. } => RESPONSE_TIMESYNC,
            Msg::Rx(_) => RX_RESPONSE,
        }
    }

    /// Encode into `buf`, returning the total record length.
    ///
    /// Fails with [`RalError::RecordTooLong`] if the record would not be an
    /// atomic pipe write.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (head, body) = buf.split_at_mut(HEADER_LEN);

        let mut w = WireWriter::new(body);

        match self {
            Msg::Config(c) => {
                w.put(&c.region)?;
                w.put(&(c.upchannels.len() as u8))?;

                for (freq, rps) in &c.upchannels {
                    w.put(freq)?;
                    w.put(&rps.to_raw())?;
                }

                w.put_bytes(&c.hwconf)?;
            }
            Msg::Tx {
                rctx,
                rps,
                xtime,
                freq,
                txpow,
                addcrc,
                payload,
                ..
            } => {
                w.put(rctx)?;
                w.put(&rps.to_raw())?;
                w.put(xtime)?;
                w.put(freq)?;
                w.put(txpow)?;
                w.put(addcrc)?;
                w.put_bytes(payload)?;
            }
            Msg::TxStatus { rctx } | Msg::TxAbort { rctx } => {
                w.put(rctx)?;
            }
            Msg::Timesync | Msg::Stop => {}
            Msg::Response { to_code, status } => {
                w.put(to_code)?;
                w.put(status)?;
            }
            Msg::TimesyncRsp { quality, meas } => {
                w.put(quality)?;
                w.put(&meas.ustime)?;
                w.put(&meas.xtime)?;
                w.put(&meas.pps_xtime)?;
            }
            Msg::Rx(job) => {
                w.put(&job.rctx)?;
                w.put(&job.xtime)?;
                w.put(&job.rps.to_raw())?;
                w.put(&job.freq)?;
                w.put(&job.rssi)?;
                w.put(&job.snr)?;
                w.put_bytes(&job.payload)?;
            }
        }

        let body_len = w.written();
        let total = HEADER_LEN + body_len;

        if total > crate::PIPE_BUF {
            return Err(RalError::RecordTooLong { len: total }.into());
        }

        head[0] = self.code();
        head[1..3].copy_from_slice(&(body_len as u16).to_le_bytes());

        Ok(total)
    }

    /// Decode a record from its code and body.
    ///
    /// An unknown code is a protocol desync and fatal to the connection.
    pub fn decode(code: u8, body: &[u8]) -> Result<Msg, Error> {
        let mut c = WireCursor::new(body);

        let msg = match code {
            CONFIG => {
                let region = c.take::<u16>()?;
                let n = c.take::<u8>()?;

                let mut upchannels = Vec::with_capacity(usize::from(n));

                for _ in 0..n {
                    let freq = c.take::<u32>()?;
                    let rps = Rps::from_raw(c.take::<u16>()?);

                    upchannels.push((freq, rps));
                }

                let hwconf = c.take_bytes(c.remaining())?.to_vec();

                Msg::Config(ConfigMsg {
                    region,
                    upchannels,
                    hwconf,
                })
            }
            TX | TX_NOCCA => {
                let rctx = c.take::<i64>()?;
                let rps = Rps::from_raw(c.take::<u16>()?);
                let xtime = c.take::<i64>()?;
                let freq = c.take::<u32>()?;
                let txpow = c.take::<i8>()?;
                let addcrc = c.take::<bool>()?;

                let payload = HVec::from_slice(c.take_bytes(c.remaining())?)
                    .map_err(|_| WireError::InvalidValue)?;

                Msg::Tx {
                    nocca: code == TX_NOCCA,
                    rctx,
                    rps,
                    xtime,
                    freq,
                    txpow,
                    addcrc,
                    payload,
                }
            }
            TXSTATUS => Msg::TxStatus {
                rctx: c.take::<i64>()?,
            },
            TXABORT => Msg::TxAbort {
                rctx: c.take::<i64>()?,
            },
            TIMESYNC => Msg::Timesync,
            STOP => Msg::Stop,
            RESPONSE => Msg::Response {
                to_code: c.take::<u8>()?,
                status: c.take::<u8>()?,
            },
            RESPONSE_TIMESYNC => Msg::TimesyncRsp {
                quality: c.take::<i64>()?,
                meas: Measurement {
                    ustime: c.take::<i64>()?,
                    xtime: c.take::<i64>()?,
                    pps_xtime: c.take::<i64>()?,
                },
            },
            RX_RESPONSE => {
                let rctx = c.take::<i64>()?;
                let xtime = c.take::<i64>()?;
                let rps = Rps::from_raw(c.take::<u16>()?);
                let freq = c.take::<u32>()?;
                let rssi = c.take::<f32>()?;
                let snr = c.take::<f32>()?;

                let payload = HVec::from_slice(c.take_bytes(c.remaining())?)
                    .map_err(|_| WireError::InvalidValue)?;

                Msg::Rx(RxJob {
                    rctx,
                    xtime,
                    freq,
                    rps,
                    rssi,
                    snr,
                    payload,
                })
            }
            other => return Err(RalError::ProtocolDesync { code: other }.into()),
        };

        Ok(msg)
    }

    /// Convenience: encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; crate::PIPE_BUF];

        let len = self.encode(&mut buf)?;
        buf.truncate(len);

        Ok(buf)
    }
}

/// Map a TX response status byte back to a [`TxResult`].
pub fn tx_result_from_status(status: u8) -> TxResult {
    match status {
        STATUS_TX_OK => TxResult::Ok,
        STATUS_TX_NOCA => TxResult::NoCa,
        _ => TxResult::Fail,
    }
}

/// Map a [`TxResult`] to its response status byte.
pub fn tx_result_to_status(result: TxResult) -> u8 {
    match result {
        TxResult::Ok => STATUS_TX_OK,
        TxResult::Fail => STATUS_TX_FAIL,
        TxResult::NoCa => STATUS_TX_NOCA,
    }
}

/// Map a TXSTATUS response status byte back to a [`TxStatus`].
pub fn tx_status_from_status(status: u8) -> TxStatus {
    match status {
        STATUS_SCHEDULED => TxStatus::Scheduled,
        STATUS_EMITTING => TxStatus::Emitting,
        _ => TxStatus::Idle,
    }
}

/// Map a [`TxStatus`] to its response status byte.
pub fn tx_status_to_status(status: TxStatus) -> u8 {
    match status {
        TxStatus::Idle => STATUS_IDLE,
        TxStatus::Scheduled => STATUS_SCHEDULED,
        TxStatus::Emitting => STATUS_EMITTING,
    }
}

/// Build the pipe record for a [`TxJob`].
pub fn tx_record(job: &TxJob, nocca: bool) -> Msg {
    Msg::Tx {
        nocca,
        rctx: job.rctx,
        rps: job.rps,
        xtime: job.xtime,
        freq: job.freq,
        txpow: job.txpow,
        addcrc: job.addcrc,
        payload: job.payload.clone(),
    }
}

/// Reassembles records from a pipe byte stream.
///
/// One buffer per slave, bounded by `PIPE_BUF` plus one maximal in-flight
/// record.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    offset: usize,
}

impl FrameReader {
    /// Create an empty reassembly buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        // Compact before growing: everything before `offset` is consumed.
        if self.offset > 0 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }

        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete record, if any.
    pub fn next_record(&mut self) -> Result<Option<Msg>, Error> {
        let pending = &self.buf[self.offset..];

        if pending.len() < HEADER_LEN {
            return Ok(None);
        }

        let code = pending[0];
        let body_len = usize::from(u16::from_le_bytes([pending[1], pending[2]]));

        if HEADER_LEN + body_len > crate::PIPE_BUF {
            return Err(RalError::RecordTooLong {
                len: HEADER_LEN + body_len,
            }
            .into());
        }

        if pending.len() < HEADER_LEN + body_len {
            // Partial record; more bytes needed.
            return Ok(None);
        }

        let msg = Msg::decode(code, &pending[HEADER_LEN..HEADER_LEN + body_len])?;

        self.offset += HEADER_LEN + body_len;

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_rx() -> Msg {
        Msg::Rx(RxJob {
            rctx: 1 << 56,
            xtime: 0x5a_0001_0000_1234,
            freq: 868_100_000,
            rps: Rps::lora(9, 125_000),
            rssi: -104.5,
            snr: 7.25,
            payload: HVec::from_slice(&[0x40, 0x11, 0x22, 0x33, 0x44]).unwrap(),
        })
    }

    #[test]
    fn config_roundtrip_carries_channels_and_json() {
        let msg = Msg::Config(ConfigMsg {
            region: 868,
            upchannels: vec![
                (868_100_000, Rps::lora(7, 125_000)),
                (868_800_000, Rps::fsk()),
            ],
            hwconf: br#"{"device":"sim"}"#.to_vec(),
        });

        let bytes = msg.to_bytes().unwrap();

        let mut reader = FrameReader::new();
        reader.push(&bytes);

        assert_eq!(reader.next_record().unwrap(), Some(msg));
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn reassembly_across_split_reads() {
        let rx = sample_rx();
        let ts = Msg::TimesyncRsp {
            quality: 120,
            meas: Measurement {
                ustime: 1_000_000,
                xtime: 0x5a_0001_0000_0000u64 as i64,
                pps_xtime: 0,
            },
        };

        let mut stream = rx.to_bytes().unwrap();
        stream.extend_from_slice(&ts.to_bytes().unwrap());

        // Feed the byte stream in awkward chunks: the first record boundary
        // falls inside the second chunk.
        let mut reader = FrameReader::new();

        reader.push(&stream[..5]);
        assert_eq!(reader.next_record().unwrap(), None);

        let split = stream.len() - 7;
        reader.push(&stream[5..split]);

        assert_eq!(reader.next_record().unwrap(), Some(rx));
        assert_eq!(reader.next_record().unwrap(), None);

        reader.push(&stream[split..]);

        assert_eq!(reader.next_record().unwrap(), Some(ts));
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn unknown_code_is_desync() {
        let mut reader = FrameReader::new();

        reader.push(&[0x7f, 0x00, 0x00]);

        assert!(reader.next_record().is_err());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut payload = HVec::new();
        payload.resize_default(crate::MAX_FRAME_LEN).unwrap();

        let msg = Msg::Tx {
            nocca: false,
            rctx: 0,
            rps: Rps::lora(12, 125_000),
            xtime: 42,
            freq: 869_525_000,
            txpow: 27,
            addcrc: true,
            payload,
        };

        // A max-payload TX still fits PIPE_BUF comfortably.
        assert!(msg.to_bytes().is_ok());

        // A corrupted header declaring an over-long body is fatal.
        let mut reader = FrameReader::new();
        reader.push(&[TX, 0xff, 0xff]);

        assert!(reader.next_record().is_err());
    }
}
