//! Master-mode startup and subsystem coordination.
//!
//! The daemon wires the subsystems together: forward-recovers the credential
//! store, spawns the RAL supervisors, and runs TC and CUPS as independent
//! tasks on the current-thread runtime. Cross-subsystem nudges (TC giving up,
//! CUPS pushing new TC credentials) travel as [`SysEvent`]s through one
//! channel into the coordination loop below.

use crate::config::{self, StationConf};
use crate::cups::{CupsCtl, CupsEngine};
use crate::error::Error;
use crate::ral::master;
use crate::s2e::MAX_RXJOBS;
use crate::store::{Cat, CredSet, Store};
use crate::tc::{TcCtl, TcEngine, TcErr, TcState};
use crate::timesync::Timesync;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tokio::sync::{mpsc, watch};

/// Cross-subsystem notifications.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SysEvent {
    /// TC was rejected or ran out of retries; CUPS should fetch fresh
    /// configuration now.
    TriggerCups,
    /// TC connected successfully; CUPS can wait a full interval.
    CupsDelay,
    /// A CUPS round finished. `tc_changed` is set when the TC URI or
    /// credentials were replaced.
    CupsRoundDone {
        /// TC must restart to pick up new configuration.
        tc_changed: bool,
    },
}

/// Run the master daemon. Returns the process exit code.
pub async fn run(home: &Path) -> i32 {
    #[cfg(unix)]
    {
        use nix::sys::signal::{signal, SigHandler, Signal};

        // Slave pipes surface EPIPE through write errors, not signals.
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            log::error!("cannot ignore SIGPIPE: {}", e);

            return 1;
        }
    }

    let mut store = Store::new(home);

    // The store must be consistent before anything reads credentials.
    if let Err(e) = store.recover() {
        log::error!("credential store recovery failed: {}", e);

        return crate::exit_code::STORE_RECOVERY;
    }

    let conf = match StationConf::load(home) {
        Ok(conf) => conf,
        Err(e) => {
            log::error!("unusable station configuration: {}", e);

            return 1;
        }
    };

    log::info!(
        "station {} starting in {} (hwspec {}, region {})",
        conf.routerid,
        home.display(),
        conf.hwspec,
        conf.region
    );

    let hwconf_paths = config::discover_slave_confs(home);

    let mut hwconfs = Vec::with_capacity(hwconf_paths.len());

    for path in &hwconf_paths {
        match std::fs::read(path) {
            Ok(data) => hwconfs.push(data),
            Err(e) => {
                log::error!("cannot read {}: {}", path.display(), e);

                return 1;
            }
        }
    }

    let cups_enabled = matches!(store.uri(Cat::Cups, CredSet::Reg), Ok(Some(_)));

    let store = Rc::new(RefCell::new(store));
    let timesync = Rc::new(RefCell::new(Timesync::new()));

    let (uplink_tx, uplink_rx) = mpsc::channel(MAX_RXJOBS);
    let (event_tx, mut event_rx) = mpsc::channel::<SysEvent>(16);
    let (tc_ctl_tx, tc_ctl_rx) = mpsc::channel::<TcCtl>(4);
    let (cups_ctl_tx, cups_ctl_rx) = mpsc::channel::<CupsCtl>(4);
    let (tc_state_tx, tc_state_rx) = watch::channel(TcState::Ini.code());
    let (cups_state_tx, _cups_state_rx) = watch::channel(0i32);

    let (ral, sup_tasks) = match master::start(&conf, hwconfs, uplink_tx, Rc::clone(&timesync)) {
        Ok(started) => started,
        Err(e) => {
            log::error!("RAL startup failed: {}", e);

            return 1;
        }
    };

    let tc = TcEngine::new(
        conf.routerid,
        conf.region,
        cups_enabled,
        Rc::clone(&store),
        Rc::clone(&timesync),
        ral,
        uplink_rx,
        tc_ctl_rx,
        event_tx.clone(),
        tc_state_tx,
    );

    tokio::task::spawn_local(tc.run());

    if cups_enabled {
        let cups = CupsEngine::new(
            &conf,
            Rc::clone(&store),
            cups_ctl_rx,
            event_tx.clone(),
            cups_state_tx,
        );

        tokio::task::spawn_local(cups.run());
    } else {
        log::info!("no CUPS URI configured, update client disabled");
    }

    // Supervisor tasks only finish on fatal errors or shutdown.
    let mut supervisors: FuturesUnordered<_> = sup_tasks.into_iter().collect();

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { return 0 };

                handle_event(event, cups_enabled, &tc_ctl_tx, &cups_ctl_tx, &tc_state_rx).await;
            }

            sup = supervisors.next(), if !supervisors.is_empty() => {
                match sup {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        log::error!("fatal: {}", e);

                        return match e {
                            Error::Ral(_) => crate::exit_code::SLAVE_RESTARTS,
                            _ => 1,
                        };
                    }
                    Some(Err(e)) => {
                        log::error!("supervisor task panicked: {}", e);

                        return 1;
                    }
                    None => {}
                }
            }
        }
    }
}

async fn handle_event(
    event: SysEvent,
    cups_enabled: bool,
    tc_ctl: &mpsc::Sender<TcCtl>,
    cups_ctl: &mpsc::Sender<CupsCtl>,
    tc_state: &watch::Receiver<i32>,
) {
    match event {
        SysEvent::TriggerCups => {
            if cups_enabled {
                let _ = cups_ctl.send(CupsCtl::TriggerNow).await;
            } else {
                log::error!("TC gave up and no CUPS is configured; retrying TC");

                let _ = tc_ctl.send(TcCtl::Restart).await;
            }
        }

        SysEvent::CupsDelay => {
            if cups_enabled {
                let _ = cups_ctl.send(CupsCtl::Delay).await;
            }
        }

        SysEvent::CupsRoundDone { tc_changed } => {
            let tc_parked = *tc_state.borrow() == TcState::Error(TcErr::Dead).code();

            if tc_changed {
                // New TC config: tear the session down, then come back up.
                let _ = tc_ctl.send(TcCtl::Stop).await;
                let _ = tc_ctl.send(TcCtl::Restart).await;
            } else if tc_parked {
                let _ = tc_ctl.send(TcCtl::Restart).await;
            }
        }
    }
}
