//! The RAL slave process: owns the concentrator HAL for one chip.
//!
//! A slave is spawned by the master with `--slave`, its index in `SLAVE_IDX`,
//! and the two pipe ends dup'ed onto stdin/stdout. It executes commands from
//! the down-pipe, polls the HAL for received frames, and reports everything on
//! the up-pipe.
//!
//! The error posture is deliberately blunt: most own-hardware and own-protocol
//! errors are fatal and rely on the master to respawn the process. A restarted
//! slave is indistinguishable from a first-start slave; no soft state survives
//! across lifetimes.

use crate::chan::{self, AllocPhase, ChDef};
use crate::error::HalError;
use crate::hal::{self, ChipConf, CrcStatus, Hal, Modulation, SendStatus, TxMode, TxPacket, TxState};
use crate::ral::msg::{self, ConfigMsg, FrameReader, Msg};
use crate::ral::{RxJob, Rps};
use crate::timesync::{self, xtime, Measurement, Xtime};
use std::os::fd::{FromRawFd, OwnedFd};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

/// HAL RX FIFO poll period.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Packets fetched from the HAL per poll round.
const RX_BATCH: usize = 16;

/// Retries for a full up-pipe before a record is dropped.
const PIPE_WRITE_RETRIES: usize = 5;

const PIPE_WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// One configured, running concentrator.
struct Radio {
    hal: Box<dyn Hal + Send>,
    /// Randomised non-zero session tag baked into every `xtime` this slave
    /// produces. A fresh tag per HAL start invalidates downlink jobs scheduled
    /// against a previous concentrator lifetime.
    session: u8,
    last_xtime: Xtime,
    region: u16,
    gps: bool,
}

impl Radio {
    /// Extend a raw 32-bit counter to a full `xtime` of this session.
    fn extend(&mut self, xticks: u32) -> Result<Xtime, timesync::TimesyncError> {
        let x = timesync::xticks_to_xtime(xticks, self.last_xtime)?;

        if x > self.last_xtime {
            self.last_xtime = x;
        }

        Ok(x)
    }
}

enum WriteOutcome {
    Written,
    Dropped,
    MasterGone,
}

/// Entry point of the slave process. Returns the process exit code.
pub async fn run(idx: u8) -> i32 {
    log::info!("slave {} starting, pid {}", idx, std::process::id());

    // stdin/stdout are the pipe ends the master handed us.
    let (rx, tx) = match pipe_ends() {
        Ok(ends) => ends,
        Err(e) => {
            log::error!("slave {}: cannot set up pipes: {}", idx, e);

            return 1;
        }
    };

    match slave_loop(idx, rx, tx).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("slave {}: fatal: {}", idx, e);

            1
        }
    }
}

#[cfg(unix)]
fn pipe_ends() -> std::io::Result<(pipe::Receiver, pipe::Sender)> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::fd::BorrowedFd;

    for fd in [0, 1] {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };

        fcntl(bfd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }

    let rx = pipe::Receiver::from_owned_fd(unsafe { OwnedFd::from_raw_fd(0) })?;
    let tx = pipe::Sender::from_owned_fd(unsafe { OwnedFd::from_raw_fd(1) })?;

    Ok((rx, tx))
}

async fn slave_loop(idx: u8, mut rx: pipe::Receiver, tx: pipe::Sender) -> Result<i32, crate::error::Error> {
    let mut reader = FrameReader::new();
    let mut chunk = vec![0u8; crate::PIPE_BUF];
    let mut radio: Option<Radio> = None;

    let mut poll = interval(RX_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = rx.read(&mut chunk) => {
                let n = read?;

                if n == 0 {
                    // Master closed the pipe: it is gone, and so are we.
                    log::warn!("slave {}: EOF on command pipe, exiting", idx);

                    return Ok(crate::exit_code::SLAVE_PIPE_EOF);
                }

                reader.push(&chunk[..n]);

                while let Some(cmd) = reader.next_record()? {
                    if let Some(code) = handle_command(idx, cmd, &mut radio, &tx).await? {
                        return Ok(code);
                    }
                }
            }

            _ = poll.tick(), if radio.is_some() => {
                if let Some(r) = radio.as_mut() {
                    if let Some(code) = poll_rx(idx, r, &tx).await? {
                        return Ok(code);
                    }
                }
            }
        }
    }
}

/// Execute one command record. Returns `Some(exit_code)` to terminate.
async fn handle_command(
    idx: u8,
    cmd: Msg,
    radio: &mut Option<Radio>,
    tx: &pipe::Sender,
) -> Result<Option<i32>, crate::error::Error> {
    match cmd {
        Msg::Config(conf) => {
            *radio = Some(configure(idx, conf)?);

            // The implicit first timesync doubles as the config ack.
            let r = radio.as_mut().ok_or(crate::error::Error::Internal)?;
            let rsp = measure_timesync(idx, r)?;

            match write_record(tx, &rsp.to_bytes()?).await {
                WriteOutcome::MasterGone => return Ok(Some(1)),
                WriteOutcome::Dropped => {
                    log::error!("slave {}: dropped initial timesync response", idx)
                }
                WriteOutcome::Written => {}
            }
        }

        Msg::Tx {
            nocca,
            rctx,
            rps,
            xtime,
            freq,
            txpow,
            addcrc,
            payload,
        } => {
            let Some(r) = radio.as_mut() else {
                log::error!("slave {}: TX before CONFIG", idx);

                return Ok(Some(1));
            };

            let status = submit_tx(idx, r, rps, xtime, freq, txpow, addcrc, &payload);

            log::debug!(
                "slave {}: TX rctx={} {:?} freq={} -> status {}{}",
                idx,
                rctx,
                rps,
                freq,
                status,
                if nocca { " (nocca requested)" } else { "" },
            );

            // Region 0 runs without LBT gating and sends no TX response.
            if r.region != 0 {
                let rsp = Msg::Response {
                    to_code: if nocca { msg::TX_NOCCA } else { msg::TX },
                    status,
                };

                if let WriteOutcome::MasterGone = write_record(tx, &rsp.to_bytes()?).await {
                    return Ok(Some(1));
                }
            }
        }

        Msg::TxStatus { rctx } => {
            let status = match radio.as_mut() {
                None => msg::STATUS_IDLE,
                Some(r) => match r.hal.status() {
                    Ok(TxState::Free) => msg::STATUS_IDLE,
                    Ok(TxState::Scheduled) => msg::STATUS_SCHEDULED,
                    Ok(TxState::Emitting) => msg::STATUS_EMITTING,
                    Err(e) => {
                        log::error!("slave {}: TXSTATUS rctx={} failed: {}", idx, rctx, e);

                        msg::STATUS_IDLE
                    }
                },
            };

            let rsp = Msg::Response {
                to_code: msg::TXSTATUS,
                status,
            };

            if let WriteOutcome::MasterGone = write_record(tx, &rsp.to_bytes()?).await {
                return Ok(Some(1));
            }
        }

        Msg::TxAbort { rctx } => {
            if let Some(r) = radio.as_mut() {
                if let Err(e) = r.hal.abort_tx() {
                    log::warn!("slave {}: TXABORT rctx={} failed: {}", idx, rctx, e);
                }
            }
        }

        Msg::Timesync => {
            let Some(r) = radio.as_mut() else {
                log::error!("slave {}: TIMESYNC before CONFIG", idx);

                return Ok(Some(1));
            };

            let rsp = measure_timesync(idx, r)?;

            if let WriteOutcome::MasterGone = write_record(tx, &rsp.to_bytes()?).await {
                return Ok(Some(1));
            }
        }

        Msg::Stop => {
            if let Some(mut r) = radio.take() {
                if let Err(e) = r.hal.stop() {
                    log::warn!("slave {}: HAL stop failed: {}", idx, e);
                }
            }

            log::info!("slave {}: stopped", idx);
        }

        // Response records only ever travel slave -> master.
        other => {
            log::error!("slave {}: unexpected record {:#04x}", idx, other.code());

            return Ok(Some(1));
        }
    }

    Ok(None)
}

/// Bring up the HAL per the pushed configuration. Any stage failure is fatal.
fn configure(idx: u8, conf: ConfigMsg) -> Result<Radio, crate::error::Error> {
    let chip: ChipConf = serde_json::from_slice(&conf.hwconf)?;

    // Map this chip's channels onto its modems; the same allocator ran on the
    // master to split channels over chips.
    let channels: Vec<ChDef> = conf
        .upchannels
        .iter()
        .map(|(freq, rps)| ChDef {
            freq: *freq,
            rps: *rps,
        })
        .collect();

    let unassigned = chan::assign(1, &channels, |phase| {
        if let AllocPhase::Ch {
            modem, rff, ch, ..
        } = phase
        {
            log::debug!(
                "slave {}: modem {} rff {} <- {} Hz {:?}",
                idx,
                modem,
                rff,
                ch.freq,
                ch.rps
            );
        }
    });

    if unassigned > 0 {
        log::warn!(
            "slave {}: {} channels do not fit this chip",
            idx,
            unassigned
        );
    }

    if let Some(script) = &chip.init_script {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .status()?;

        if !status.success() {
            log::error!("slave {}: init script failed: {}", idx, status);

            return Err(HalError::Start.into());
        }
    }

    let mut hal = hal::open(&chip)?;
    hal.start()?;
    hal.set_gps_enable(true)?;

    let session = loop {
        let tag: u8 = rand::random();

        if tag != 0 {
            break tag;
        }
    };

    let start = hal.get_instcnt()?;

    log::info!(
        "slave {}: HAL started, session {:#04x}, region {}",
        idx,
        session,
        conf.region
    );

    Ok(Radio {
        hal,
        session,
        last_xtime: xtime::mk(idx, session, i64::from(start)),
        region: conf.region,
        gps: true,
    })
}

/// Read the concentrator counters and wrap them into a timesync response.
fn measure_timesync(idx: u8, r: &mut Radio) -> Result<Msg, crate::error::Error> {
    let t0 = timesync::ustime_now();
    let instcnt = r.hal.get_instcnt()?;
    let t1 = timesync::ustime_now();

    let xt = match r.extend(instcnt) {
        Ok(x) => x,
        Err(e) => {
            log::error!("slave {}: counter extension failed: {}", idx, e);

            return Err(e.into());
        }
    };

    let pps_xtime = if r.gps {
        // Keep the latch disabled while polling so a pulse cannot land
        // mid-readout.
        r.hal.set_gps_enable(false)?;
        let trig = r.hal.get_trigcnt()?;
        r.hal.set_gps_enable(true)?;

        if trig == 0 {
            0
        } else {
            r.extend(trig).unwrap_or(0)
        }
    } else {
        0
    };

    Ok(Msg::TimesyncRsp {
        quality: t1 - t0,
        meas: Measurement {
            ustime: t0 + (t1 - t0) / 2,
            xtime: xt,
            pps_xtime,
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn submit_tx(
    idx: u8,
    r: &mut Radio,
    rps: Rps,
    xtime_val: Xtime,
    freq: u32,
    txpow: i8,
    addcrc: bool,
    payload: &[u8],
) -> u8 {
    if xtime::session(xtime_val) != r.session {
        log::error!(
            "slave {}: TX for stale session {:#04x} (current {:#04x})",
            idx,
            xtime::session(xtime_val),
            r.session
        );

        return msg::STATUS_TX_FAIL;
    }

    let beacon = rps.is_beacon();

    let pkt = TxPacket {
        count_us: xtime::micros(xtime_val) as u32,
        freq_hz: freq,
        power: txpow,
        modulation: if rps.is_fsk() {
            Modulation::Fsk
        } else {
            Modulation::Lora
        },
        datarate: rps.sf().unwrap_or(0),
        bandwidth: rps.bw(),
        preamble: if beacon { 10 } else { 8 },
        no_header: beacon,
        invert_pol: !beacon,
        no_crc: !addcrc,
        mode: if beacon {
            TxMode::OnGps
        } else {
            TxMode::Timestamped
        },
        payload: match heapless::Vec::from_slice(payload) {
            Ok(p) => p,
            Err(_) => return msg::STATUS_TX_FAIL,
        },
    };

    match r.hal.send(&pkt) {
        Ok(SendStatus::Ok) => msg::STATUS_TX_OK,
        Ok(SendStatus::LbtBusy) => msg::STATUS_TX_NOCA,
        Ok(SendStatus::Error) => msg::STATUS_TX_FAIL,
        Err(e) => {
            log::error!("slave {}: HAL send failed: {}", idx, e);

            msg::STATUS_TX_FAIL
        }
    }
}

/// Drain the HAL RX FIFO and forward frames on the up-pipe.
async fn poll_rx(
    idx: u8,
    r: &mut Radio,
    tx: &pipe::Sender,
) -> Result<Option<i32>, crate::error::Error> {
    let packets = r.hal.receive(RX_BATCH)?;

    for pkt in packets {
        if pkt.crc_status == CrcStatus::Bad {
            log::debug!("slave {}: CRC fail on {} Hz, dropped", idx, pkt.freq_hz);

            continue;
        }

        if pkt.payload.len() > crate::MAX_FRAME_LEN {
            log::warn!(
                "slave {}: oversized frame of {} bytes dropped",
                idx,
                pkt.payload.len()
            );

            continue;
        }

        let rps = match pkt.modulation {
            Modulation::Fsk => Rps::fsk(),
            Modulation::Lora => Rps::lora(pkt.datarate, pkt.bandwidth),
        };

        if rps == Rps::ILLEGAL {
            log::warn!(
                "slave {}: unmappable modulation SF{}/BW{} dropped",
                idx,
                pkt.datarate,
                pkt.bandwidth
            );

            continue;
        }

        let xt = match r.extend(pkt.count_us) {
            Ok(x) => x,
            Err(e) => {
                log::error!("slave {}: RX frame timestamp unusable: {}", idx, e);

                continue;
            }
        };

        let record = Msg::Rx(RxJob {
            rctx: i64::from(idx),
            xtime: xt,
            freq: pkt.freq_hz,
            rps,
            rssi: pkt.rssi,
            snr: pkt.snr,
            payload: pkt.payload,
        });

        match write_record(tx, &record.to_bytes()?).await {
            WriteOutcome::Written => {}
            WriteOutcome::Dropped => {
                log::error!("slave {}: up-pipe full, RX frame dropped", idx);
            }
            WriteOutcome::MasterGone => return Ok(Some(1)),
        }
    }

    Ok(None)
}

/// Write one record to the up-pipe.
///
/// A full pipe is retried a few times and then the record is dropped; the
/// slave must not stall RX polling behind a blocked master. A broken pipe
/// means the master died and the slave has no reason to live.
async fn write_record(tx: &pipe::Sender, record: &[u8]) -> WriteOutcome {
    debug_assert!(record.len() <= crate::PIPE_BUF);

    for attempt in 0..=PIPE_WRITE_RETRIES {
        match tx.try_write(record) {
            Ok(n) if n == record.len() => return WriteOutcome::Written,
            Ok(n) => {
                // Atomicity of <= PIPE_BUF writes makes this unreachable.
                log::error!("partial pipe write: {} of {} bytes", n, record.len());

                return WriteOutcome::Dropped;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if attempt < PIPE_WRITE_RETRIES {
                    sleep(PIPE_WRITE_RETRY_DELAY).await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log::error!("up-pipe broken, master is gone");

                return WriteOutcome::MasterGone;
            }
            Err(e) => {
                log::error!("up-pipe write error: {}", e);

                return WriteOutcome::Dropped;
            }
        }
    }

    WriteOutcome::Dropped
}
