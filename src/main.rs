//! The `lorastation` binary.
//!
//! Runs as the master daemon by default; with `--slave` it becomes a RAL
//! slave process owning one concentrator chip (spawned by the master with the
//! pipe ends on stdin/stdout and its index in `SLAVE_IDX`).

use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Several TLS-using dependencies ship their own rustls provider features;
    // pin the process-wide default before any of them builds a config.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut slave = false;
    let mut home: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--slave" => slave = true,
            "--home" | "-h" => home = args.next().map(PathBuf::from),
            other => {
                eprintln!("usage: lorastation [--home DIR] [--slave]");
                eprintln!("unknown argument `{}`", other);

                return ExitCode::from(2);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("cannot start runtime: {}", e);

            return ExitCode::from(lorastation::exit_code::EVENT_LOOP as u8);
        }
    };

    let code = if slave {
        let idx = std::env::var("SLAVE_IDX")
            .ok()
            .and_then(|v| v.parse::<u8>().ok());

        let Some(idx) = idx else {
            log::error!("--slave requires SLAVE_IDX");

            return ExitCode::from(2);
        };

        runtime.block_on(lorastation::ral::slave::run(idx))
    } else {
        let home = home
            .or_else(|| std::env::var("STATION_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let local = tokio::task::LocalSet::new();

        runtime.block_on(local.run_until(lorastation::daemon::run(&home)))
    };

    ExitCode::from(code.clamp(0, 255) as u8)
}
