//! A minimal TCP service used to exercise `relaunch` end to end: it
//! answers every connection with its own generation id, and its
//! behavior around exiting, sleeping, and ignoring shutdown requests is
//! tunable via environment variables so the integration tests in
//! `crates/relaunch/tests/` can drive every scenario from one binary.
//!
//! Environment variables (all optional):
//! - `DEMO_ADDR`: address to bind, e.g. `127.0.0.1:0`. Defaults to
//!   `127.0.0.1:0` (OS-assigned port) when unset and no `relaunch`
//!   address is otherwise configured -- in practice the master always
//!   supplies the listener, this is only a fallback for ad hoc runs.
//! - `DEMO_EXIT_CODE`: if set, `program` returns this code immediately
//!   without serving anything (exercises transparent-crash behavior).
//! - `DEMO_SLEEP_MS`: per-request delay before responding.
//! - `DEMO_IGNORE_TERMINATE`: if set, the accept loop never checks
//!   `should_terminate()`, forcing the master's terminate-timeout kill path.
//! - `DEMO_TERMINATE_TIMEOUT_MS`: overrides `Config::terminate_timeout`.
//! - `DEMO_RESTART_SIGNAL`: overrides the restart signal (decimal, e.g. `12`).
//! - `DEMO_FETCH_PATH`: if set, wires up a `FileFetcher` watching this path.
//! - `DEMO_NO_RESTART_AFTER_FETCH`: if set, passes `no_restart_after_fetch(true)`.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relaunch::{Config, ExitCode, FileFetcher, State};

fn main() {
    env_logger_init_if_present();

    let addr: SocketAddr = std::env::var("DEMO_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());

    let program = Arc::new(serve);

    let mut builder = Config::builder(program).address(addr);

    if let Ok(ms) = std::env::var("DEMO_TERMINATE_TIMEOUT_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            builder = builder.terminate_timeout(Duration::from_millis(ms));
        }
    }

    if let Ok(sig) = std::env::var("DEMO_RESTART_SIGNAL") {
        if let Ok(raw) = sig.parse::<i32>() {
            if let Ok(signal) = nix::sys::signal::Signal::try_from(raw) {
                builder = builder.restart_signal(signal);
            }
        }
    }

    if let Ok(path) = std::env::var("DEMO_FETCH_PATH") {
        builder = builder.fetcher(Box::new(FileFetcher::new(PathBuf::from(path))));
    }

    if std::env::var("DEMO_NO_RESTART_AFTER_FETCH").is_ok() {
        builder = builder.no_restart_after_fetch(true);
    }

    let config = builder.build().expect("valid demo config");

    let code = relaunch::bootstrap::run(config).unwrap_or_else(|err| {
        eprintln!("relaunch-demo-echo: fatal: {}", err);
        1
    });
    std::process::exit(code);
}

fn serve(state: State) -> ExitCode {
    if let Ok(code) = std::env::var("DEMO_EXIT_CODE") {
        if let Ok(code) = code.parse::<i32>() {
            return code;
        }
    }

    let sleep = std::env::var("DEMO_SLEEP_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis);
    let ignore_terminate = std::env::var("DEMO_IGNORE_TERMINATE").is_ok();

    let listener = match state.listeners().first() {
        Some(l) => l.try_clone().expect("clone listener"),
        None => return 0,
    };
    listener.set_nonblocking(true).expect("nonblocking listener");

    let generation = state.generation();
    let mut handlers = Vec::new();

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let handle = thread::spawn(move || handle_connection(stream, generation, sleep));
                handlers.push(handle);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if !ignore_terminate && state.should_terminate() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                log::warn!("[gen {}] accept error: {}", generation, e);
            }
        }
    }

    for handle in handlers {
        let _ = handle.join();
    }

    0
}

fn handle_connection(mut stream: TcpStream, generation: u64, sleep: Option<Duration>) {
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf);

    if let Some(sleep) = sleep {
        thread::sleep(sleep);
    }

    let body = generation.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn env_logger_init_if_present() {
    let _ = env_logger::try_init();
}
