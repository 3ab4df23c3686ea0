//! End-to-end CUPS round against an in-process HTTP server.
//!
//! The server pushes a new TC URI and TC credentials through the segment
//! protocol; the engine must stage them, commit transactionally and ask the
//! daemon to restart TC.

use lorastation::config::StationConf;
use lorastation::cups::{CupsCtl, CupsEngine};
use lorastation::daemon::SysEvent;
use lorastation::store::{Cat, CredSet, Elem, Store};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

fn segment(width: usize, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..width]);
    out.extend_from_slice(payload);

    out
}

/// Minimal HTTP/1.1 exchange: consume the POST, answer with a segment body.
async fn cups_server(listener: TcpListener, request_tx: mpsc::UnboundedSender<String>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };

    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];

    let (head_end, body_len) = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up mid-request");

        raw.extend_from_slice(&chunk[..n]);

        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..pos]).to_string();

            let body_len = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;

                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);

            break (pos + 4, body_len);
        }
    };

    while raw.len() < head_end + body_len {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);

        raw.extend_from_slice(&chunk[..n]);
    }

    let _ = request_tx.send(String::from_utf8_lossy(&raw[head_end..head_end + body_len]).to_string());

    // cupsUri: unchanged, tcUri: new, cupsCred: unchanged, tcCred: one trust
    // SEQUENCE, no signature, no update.
    let mut body = Vec::new();

    body.extend(segment(1, &[]));
    body.extend(segment(1, b"wss://new-lns.example:6887"));
    body.extend(segment(2, &[]));
    body.extend(segment(2, &[0x30, 0x03, 0x74, 0x63, 0x21]));
    body.extend(segment(4, &[]));
    body.extend(segment(4, &[]));

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.write_all(&body).await;
    let _ = stream.shutdown().await;
}

#[test]
fn cups_round_stages_and_commits_tc_config() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (request_tx, mut request_rx) = mpsc::unbounded_channel();

        tokio::spawn(cups_server(listener, request_tx));

        let home = tempfile::tempdir().unwrap();

        std::fs::write(
            home.path().join("cups.uri"),
            format!("http://127.0.0.1:{}\n", port),
        )
        .unwrap();
        std::fs::write(home.path().join("tc.uri"), "wss://old-lns.example:6887\n").unwrap();

        let mut store = Store::new(home.path());
        store.recover().unwrap();

        let store = Rc::new(RefCell::new(store));

        let conf: StationConf =
            serde_json::from_str(r#"{ "routerid": "1-2-3-4-5-6-7-8" }"#).unwrap();

        let (ctl_tx, ctl_rx) = mpsc::channel::<CupsCtl>(4);
        let (event_tx, mut event_rx) = mpsc::channel::<SysEvent>(8);
        let (state_tx, _state_rx) = watch::channel(0i32);

        let engine = CupsEngine::new(&conf, Rc::clone(&store), ctl_rx, event_tx, state_tx);

        tokio::task::spawn_local(engine.run());

        // Skip the initial delay.
        ctl_tx.send(CupsCtl::TriggerNow).await.unwrap();

        // The request carries our identity and CRCs.
        let request = timeout(Duration::from_secs(10), request_rx.recv())
            .await
            .expect("server contacted")
            .unwrap();

        let request: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(request["router"], "1-2-3-4-5-6-7-8");
        assert_eq!(request["tcUri"], "wss://old-lns.example:6887");
        assert_eq!(request["tcCredCrc"], 0);
        assert!(request["keys"].as_array().unwrap().is_empty());

        // The round completes and asks for a TC restart.
        let event = timeout(Duration::from_secs(10), event_rx.recv())
            .await
            .expect("round finished")
            .unwrap();

        assert_eq!(event, SysEvent::CupsRoundDone { tc_changed: true });

        // Everything committed: new URI active, credentials split into their
        // element files, no staging residue.
        let mut store = store.borrow_mut();

        assert_eq!(
            store.uri(Cat::Tc, CredSet::Reg).unwrap().as_deref(),
            Some("wss://new-lns.example:6887")
        );
        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Reg, Elem::Trust).unwrap(),
            Some(vec![0x30, 0x03, 0x74, 0x63, 0x21])
        );
        assert_eq!(
            store.read_elem(Cat::Tc, CredSet::Reg, Elem::Cert).unwrap(),
            Some(Vec::new())
        );
        assert!(!store.has_pending(Cat::Tc));
    }));
}
