//! The RAL master: spawns, configures and supervises one slave process per
//! concentrator chip.
//!
//! Slaves are expendable. Hardware faults, protocol desyncs and crashes all
//! end the same way: the master kills what is left of the process, spawns a
//! fresh one, and pushes the chip configuration again. Only a slave that dies
//! repeatedly without ever answering takes the whole station down.

use crate::chan::{self, AllocPhase, ChDef};
use crate::config::StationConf;
use crate::error::{Error, RalError};
use crate::hal::ChipConf;
use crate::ral::msg::{self, FrameReader, Msg};
use crate::ral::{
    Ral, RxJob, Rps, SlaveHandle, SupRequest, TxResult, TxStatus, SYNC_REQUEST_TIMEOUT,
};
use crate::s2e::DrTable;
use crate::timesync::Timesync;
use std::cell::RefCell;
use std::process::Stdio;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Duration, Instant, MissedTickBehavior};

/// More consecutive restarts than this without a single valid record from the
/// slave is process-fatal.
const RESTART_BUDGET: u32 = 4;

/// Delay between kill attempts while waiting for a stubborn slave to die.
const KILL_RETRY: Duration = Duration::from_millis(100);

/// Liveness poll period for the slave pid.
const RECHECK_SLAVE: Duration = Duration::from_millis(500);

/// Kill attempts that still use SIGTERM before escalating to SIGKILL.
const POLITE_KILLS: u32 = 2;

/// Start the RAL: allocate channels, spawn one supervisor task per usable
/// slave and return the uniform API handle.
///
/// The returned join handles complete only on fatal supervisor errors (or
/// shutdown); the daemon watches them.
pub fn start(
    conf: &StationConf,
    hwconfs: Vec<Vec<u8>>,
    uplinks: mpsc::Sender<RxJob>,
    timesync: Rc<RefCell<Timesync>>,
) -> Result<(Ral, Vec<JoinHandle<Result<(), Error>>>), Error> {
    let chips = conf.hwspec_chips()?;
    let found = hwconfs.len();

    if found == 0 {
        log::error!("no slave-<i>.conf files found");

        return Err(RalError::HwspecMismatch.into());
    }

    if chips > found {
        log::error!(
            "hwspec `{}` wants {} chips but only {} slave configs exist",
            conf.hwspec,
            chips,
            found
        );

        return Err(RalError::HwspecMismatch.into());
    }

    let usable_slaves = if chips < found {
        if found % chips == 0 {
            // Antenna diversity: every physical chip serves a copy of the
            // logical plan.
            log::info!(
                "antenna diversity: {} chips replicate a {}-chip plan",
                found,
                chips
            );

            found
        } else {
            log::warn!(
                "{} slave configs for a {}-chip hwspec; extras left unused",
                found,
                chips
            );

            chips
        }
    } else {
        found
    };

    // Split the channel plan over the logical chips.
    let channels: Vec<ChDef> = conf
        .channels
        .iter()
        .map(|c| ChDef {
            freq: c.freq,
            rps: if c.sf == 0 {
                Rps::fsk()
            } else {
                Rps::lora(c.sf, c.bw)
            },
        })
        .collect();

    let mut upchannels: Vec<Vec<(u32, Rps)>> = vec![Vec::new(); chips];

    let unassigned = chan::assign(chips, &channels, |phase| match phase {
        AllocPhase::Ch { chip, ch, .. } => upchannels[chip].push((ch.freq, ch.rps)),
        AllocPhase::ChipDone {
            chip,
            span,
            modems,
            ..
        } => {
            log::info!(
                "chip {}: {} modems over {}..{} Hz",
                chip,
                modems,
                span.0,
                span.1
            );
        }
        _ => {}
    });

    if unassigned > 0 {
        log::warn!("{} channels fit on no chip", unassigned);
    }

    let mut handles = Vec::with_capacity(usable_slaves);
    let mut tasks = Vec::with_capacity(usable_slaves);

    for idx in 0..usable_slaves {
        let hwconf = hwconfs[idx].clone();

        // Early parse so a broken slave conf is a startup error, and we learn
        // the antenna wiring for downlink replication decisions.
        let chip: ChipConf = serde_json::from_slice(&hwconf)?;

        let (req_tx, req_rx) = mpsc::channel(8);
        let usable = Arc::new(AtomicBool::new(false));

        handles.push(SlaveHandle {
            requests: req_tx,
            antenna: chip.antenna,
            usable: Arc::clone(&usable),
        });

        let sup = Supervisor {
            idx: idx as u8,
            region: conf.region,
            hwconf,
            upchannels: upchannels[idx % chips].clone(),
            usable,
            uplinks: uplinks.clone(),
            timesync: Rc::clone(&timesync),
            requests: req_rx,
            dr: DrTable::for_region(conf.region),
            restart_count: 0,
            kill_count: 0,
            stale: None,
        };

        tasks.push(tokio::task::spawn_local(sup.run()));
    }

    Ok((Ral::new(handles), tasks))
}

/// Why one slave lifetime ended.
enum LifeEnd {
    /// The child died or its pipe broke; respawn.
    Died,
    /// The request channel closed: the daemon is shutting down.
    Shutdown,
}

struct Supervisor {
    idx: u8,
    region: u16,
    hwconf: Vec<u8>,
    upchannels: Vec<(u32, Rps)>,
    usable: Arc<AtomicBool>,
    uplinks: mpsc::Sender<RxJob>,
    timesync: Rc<RefCell<Timesync>>,
    requests: mpsc::Receiver<SupRequest>,
    dr: DrTable,
    /// Consecutive respawns without a valid record from the slave.
    restart_count: u32,
    /// Signals sent to get rid of live-but-useless slaves.
    kill_count: u32,
    /// Command code whose response the master stopped waiting for. A late
    /// response matching it is discarded instead of tripping the desync check.
    stale: Option<u8>,
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    reader: FrameReader,
}

impl Supervisor {
    async fn run(mut self) -> Result<(), Error> {
        loop {
            if self.restart_count > RESTART_BUDGET {
                log::error!(
                    "slave {}: {} consecutive restarts without progress",
                    self.idx,
                    self.restart_count
                );

                return Err(RalError::SlaveDead.into());
            }

            let mut pipes = match self.spawn_slave().await {
                Ok(pipes) => pipes,
                Err(e) => {
                    log::error!("slave {}: spawn failed: {}", self.idx, e);

                    self.restart_count += 1;
                    sleep(KILL_RETRY).await;

                    continue;
                }
            };

            self.usable.store(true, Ordering::Relaxed);

            let end = self.lifetime(&mut pipes).await;

            self.usable.store(false, Ordering::Relaxed);
            self.reap(&mut pipes.child).await;

            match end {
                LifeEnd::Shutdown => {
                    log::info!("slave {}: supervisor shutting down", self.idx);

                    return Ok(());
                }
                LifeEnd::Died => {
                    self.restart_count += 1;

                    log::warn!(
                        "slave {}: lifetime ended, respawn #{}",
                        self.idx,
                        self.restart_count
                    );
                }
            }
        }
    }

    /// Fork a fresh slave and push its configuration.
    async fn spawn_slave(&mut self) -> Result<Pipes, Error> {
        let exe = std::env::current_exe()?;

        let mut child = Command::new(exe)
            .arg("--slave")
            .env("SLAVE_IDX", self.idx.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or(Error::Internal)?;
        let stdout = child.stdout.take().ok_or(Error::Internal)?;

        log::info!(
            "slave {}: spawned pid {}",
            self.idx,
            child.id().unwrap_or(0)
        );

        let config = Msg::Config(msg::ConfigMsg {
            region: self.region,
            upchannels: self.upchannels.clone(),
            hwconf: self.hwconf.clone(),
        });

        stdin.write_all(&config.to_bytes()?).await?;

        Ok(Pipes {
            child,
            stdin,
            stdout,
            reader: FrameReader::new(),
        })
    }

    /// Drive one slave lifetime until it dies or the daemon shuts down.
    async fn lifetime(&mut self, pipes: &mut Pipes) -> LifeEnd {
        let mut chunk = vec![0u8; crate::PIPE_BUF];

        let mut recheck = interval(RECHECK_SLAVE);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first timesync is requested by CONFIG itself; subsequent ones
        // follow the interval hints from the timesync filter.
        let mut next_timesync = Instant::now() + Duration::from_secs(3600);

        loop {
            tokio::select! {
                read = pipes.stdout.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            log::warn!("slave {}: EOF on up-pipe", self.idx);

                            return LifeEnd::Died;
                        }
                        Ok(n) => {
                            pipes.reader.push(&chunk[..n]);

                            match self.drain_records(&mut pipes.reader, &mut next_timesync) {
                                Ok(()) => {}
                                Err(e) => {
                                    log::error!("slave {}: {}", self.idx, e);

                                    return LifeEnd::Died;
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("slave {}: up-pipe read error: {}", self.idx, e);

                            return LifeEnd::Died;
                        }
                    }
                }

                req = self.requests.recv() => {
                    match req {
                        None => return LifeEnd::Shutdown,
                        Some(req) => {
                            if let Err(e) = self.handle_request(pipes, req, &mut next_timesync).await {
                                log::error!("slave {}: request failed: {}", self.idx, e);

                                return LifeEnd::Died;
                            }
                        }
                    }
                }

                _ = sleep_until(next_timesync) => {
                    next_timesync = Instant::now() + Duration::from_secs(3600);

                    let record = match Msg::Timesync.to_bytes() {
                        Ok(r) => r,
                        Err(_) => continue,
                    };

                    if pipes.stdin.write_all(&record).await.is_err() {
                        log::warn!("slave {}: down-pipe broken", self.idx);

                        return LifeEnd::Died;
                    }
                }

                _ = recheck.tick() => {
                    match pipes.child.try_wait() {
                        Ok(Some(status)) => {
                            log::warn!("slave {}: exited with {}", self.idx, status);

                            return LifeEnd::Died;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("slave {}: wait failed: {}", self.idx, e);

                            return LifeEnd::Died;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch every complete record sitting in the reassembly buffer.
    fn drain_records(
        &mut self,
        reader: &mut FrameReader,
        next_timesync: &mut Instant,
    ) -> Result<(), Error> {
        while let Some(record) = reader.next_record()? {
            self.dispatch(record, next_timesync)?;
        }

        Ok(())
    }

    /// Handle one unsolicited record from the slave.
    fn dispatch(&mut self, record: Msg, next_timesync: &mut Instant) -> Result<(), Error> {
        // Anything well-formed counts as progress.
        self.restart_count = 0;

        match record {
            Msg::Rx(job) => {
                if self.dr.rps_to_dr(job.rps).is_none() {
                    log::warn!(
                        "slave {}: RX frame with unmappable {:?} rejected",
                        self.idx,
                        job.rps
                    );

                    return Ok(());
                }

                if let Err(mpsc::error::TrySendError::Full(_)) = self.uplinks.try_send(job) {
                    log::error!("slave {}: uplink queue full, frame dropped", self.idx);
                }
            }

            Msg::TimesyncRsp { quality, meas } => {
                let delay = self
                    .timesync
                    .borrow_mut()
                    .update(self.idx, quality, meas);

                *next_timesync = Instant::now() + Duration::from_micros(delay.max(0) as u64);
            }

            Msg::Response { to_code, status } => {
                if self.stale == Some(to_code) {
                    self.stale = None;

                    log::info!(
                        "slave {}: discarding stale response to {:#04x} (status {})",
                        self.idx,
                        to_code,
                        status
                    );
                } else {
                    // A response nobody is waiting for: the byte stream is no
                    // longer trustworthy.
                    return Err(RalError::ProtocolDesync { code: to_code }.into());
                }
            }

            other => {
                return Err(RalError::ProtocolDesync { code: other.code() }.into());
            }
        }

        Ok(())
    }

    /// Execute one caller request, including the bounded synchronous wait for
    /// TX/TXSTATUS responses.
    async fn handle_request(
        &mut self,
        pipes: &mut Pipes,
        req: SupRequest,
        next_timesync: &mut Instant,
    ) -> Result<(), Error> {
        match req {
            SupRequest::Tx { job, nocca, reply } => {
                let record = msg::tx_record(&job, nocca).to_bytes()?;

                pipes.stdin.write_all(&record).await?;

                // Region 0 slaves send no TX response at all.
                if self.region == 0 {
                    let _ = reply.send(TxResult::Ok);

                    return Ok(());
                }

                let expect = if nocca { msg::TX_NOCCA } else { msg::TX };

                let result = match self.wait_response(pipes, expect, next_timesync).await? {
                    Some(status) => msg::tx_result_from_status(status),
                    None => {
                        self.stale = Some(expect);

                        log::warn!("slave {}: TX response timed out", self.idx);

                        TxResult::Fail
                    }
                };

                let _ = reply.send(result);
            }

            SupRequest::TxStatus { rctx, reply } => {
                let record = Msg::TxStatus { rctx }.to_bytes()?;

                pipes.stdin.write_all(&record).await?;

                let status = match self
                    .wait_response(pipes, msg::TXSTATUS, next_timesync)
                    .await?
                {
                    Some(status) => msg::tx_status_from_status(status),
                    None => {
                        self.stale = Some(msg::TXSTATUS);

                        log::warn!("slave {}: TXSTATUS response timed out", self.idx);

                        TxStatus::Idle
                    }
                };

                let _ = reply.send(status);
            }

            SupRequest::TxAbort { rctx } => {
                let record = Msg::TxAbort { rctx }.to_bytes()?;

                pipes.stdin.write_all(&record).await?;
            }
        }

        Ok(())
    }

    /// Synchronously await the response to `expect`, dispatching any other
    /// records that arrive in the meantime. `None` on timeout.
    async fn wait_response(
        &mut self,
        pipes: &mut Pipes,
        expect: u8,
        next_timesync: &mut Instant,
    ) -> Result<Option<u8>, Error> {
        let deadline = Instant::now() + SYNC_REQUEST_TIMEOUT;
        let mut chunk = vec![0u8; crate::PIPE_BUF];

        loop {
            // Already buffered?
            while let Some(record) = pipes.reader.next_record()? {
                match record {
                    Msg::Response { to_code, status } if to_code == expect => {
                        return Ok(Some(status));
                    }
                    other => self.dispatch(other, next_timesync)?,
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                return Ok(None);
            }

            match timeout(remaining, pipes.stdout.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(RalError::SlaveDead.into()),
                Ok(Ok(n)) => pipes.reader.push(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Make sure the child is gone: SIGTERM politely, then SIGKILL, retrying
    /// until waitpid reports the pid reaped.
    async fn reap(&mut self, child: &mut Child) {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("slave {}: reaped, {}", self.idx, status);

                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("slave {}: try_wait failed: {}", self.idx, e);

                    return;
                }
            }

            self.kill_count += 1;

            #[cfg(unix)]
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let sig = if self.kill_count <= POLITE_KILLS {
                    Signal::SIGTERM
                } else {
                    Signal::SIGKILL
                };

                log::info!("slave {}: sending {} (attempt {})", self.idx, sig, self.kill_count);

                let _ = kill(Pid::from_raw(pid as i32), sig);
            }

            #[cfg(not(unix))]
            let _ = child.start_kill();

            sleep(KILL_RETRY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::{xtime, Measurement};
    use heapless::Vec as HVec;
    use pretty_assertions::assert_eq;

    fn supervisor() -> (Supervisor, mpsc::Receiver<RxJob>) {
        let (uplinks, uplink_rx) = mpsc::channel(2);
        let (_req_tx, req_rx) = mpsc::channel(1);

        (
            Supervisor {
                idx: 1,
                region: 868,
                hwconf: b"{}".to_vec(),
                upchannels: Vec::new(),
                usable: Arc::new(AtomicBool::new(true)),
                uplinks,
                timesync: Rc::new(RefCell::new(Timesync::new())),
                requests: req_rx,
                dr: DrTable::eu868(),
                restart_count: 3,
                kill_count: 0,
                stale: None,
            },
            uplink_rx,
        )
    }

    fn rx_record(rps: Rps) -> Msg {
        Msg::Rx(RxJob {
            rctx: 1,
            xtime: xtime::mk(1, 0x42, 1_000),
            freq: 868_100_000,
            rps,
            rssi: -80.0,
            snr: 5.5,
            payload: HVec::from_slice(&[1, 2, 3]).unwrap(),
        })
    }

    #[tokio::test]
    async fn rx_records_flow_to_uplink_queue() {
        let (mut sup, mut uplink_rx) = supervisor();
        let mut next = Instant::now();

        sup.dispatch(rx_record(Rps::lora(7, 125_000)), &mut next).unwrap();

        let job = uplink_rx.recv().await.unwrap();
        assert_eq!(job.freq, 868_100_000);

        // Progress resets the restart budget.
        assert_eq!(sup.restart_count, 0);
    }

    #[tokio::test]
    async fn unmappable_rps_is_rejected() {
        let (mut sup, mut uplink_rx) = supervisor();
        let mut next = Instant::now();

        sup.dispatch(rx_record(Rps::lora(9, 500_000)), &mut next).unwrap();

        assert!(uplink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_uplink_queue_drops() {
        let (mut sup, mut uplink_rx) = supervisor();
        let mut next = Instant::now();

        for _ in 0..3 {
            sup.dispatch(rx_record(Rps::lora(7, 125_000)), &mut next).unwrap();
        }

        // Queue capacity is 2; the third was dropped, not queued.
        assert!(uplink_rx.recv().await.is_some());
        assert!(uplink_rx.recv().await.is_some());
        assert!(uplink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timesync_response_reschedules() {
        let (mut sup, _uplink_rx) = supervisor();
        let mut next = Instant::now() + Duration::from_secs(3600);

        let record = Msg::TimesyncRsp {
            quality: 100,
            meas: Measurement {
                ustime: 1_000_000,
                xtime: xtime::mk(1, 0x42, 500_000),
                pps_xtime: 0,
            },
        };

        sup.dispatch(record, &mut next).unwrap();

        // Rescheduled to the filter's interval hint, well under an hour.
        assert!(next < Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn stale_response_is_discarded_once() {
        let (mut sup, _uplink_rx) = supervisor();
        let mut next = Instant::now();

        sup.stale = Some(msg::TX);

        // The late response to a timed-out TX is swallowed...
        sup.dispatch(
            Msg::Response {
                to_code: msg::TX,
                status: msg::STATUS_TX_OK,
            },
            &mut next,
        )
        .unwrap();

        assert_eq!(sup.stale, None);

        // ...but a second unexpected response is a protocol desync.
        let err = sup.dispatch(
            Msg::Response {
                to_code: msg::TX,
                status: msg::STATUS_TX_OK,
            },
            &mut next,
        );

        assert!(err.is_err());
    }
}
