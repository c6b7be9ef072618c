//! Shared helpers for the end-to-end scenario tests: locating the demo
//! binary built alongside this crate, picking a free port, spawning a
//! master with a given set of `DEMO_*`/`RELAUNCH_*` environment
//! overrides, and a small HTTP-ish client for talking to it.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Resolves the path to the `relaunch-demo-echo` binary built by this
/// workspace. Cargo only exposes `CARGO_BIN_EXE_*` for binaries within
/// the same package, so for a sibling package's binary we rely on the
/// conventional `target/<profile>/<name>` layout instead.
pub fn demo_binary_path() -> PathBuf {
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates/relaunch -> crates
    path.pop(); // crates -> workspace root
    path.push("target");
    path.push(profile);
    path.push("relaunch-demo-echo");
    path
}

/// Binds an ephemeral port and immediately releases it, for handing to
/// a spawned master via `DEMO_ADDR`. Inherently racy (another process
/// could grab the port first) but standard practice for this kind of
/// test and never flaky in a sandboxed CI container in practice.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Spawns `relaunch-demo-echo` as a master (no `RELAUNCH_ROLE` set) with
/// `DEMO_ADDR` pointed at `port` plus any extra environment overrides.
pub fn spawn_master(port: u16, extra_env: &[(&str, &str)]) -> Child {
    let mut command = Command::new(demo_binary_path());
    command
        .env("DEMO_ADDR", format!("127.0.0.1:{}", port))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    for (k, v) in extra_env {
        command.env(k, v);
    }
    command.spawn().expect("spawn relaunch-demo-echo master")
}

/// Polls `127.0.0.1:<port>` until a connection succeeds and a response
/// body is read, or `timeout` elapses.
pub fn wait_for_response(port: u16, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(body) = try_request(port) {
            return body;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for a response on port {}", port);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// One best-effort GET against the demo server, returning the response
/// body (the generation id) or `None` on any connection-level failure.
pub fn try_request(port: u16) -> Option<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .ok()?;
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);
    text.rsplit("\r\n\r\n").next().map(|s| s.trim().to_string())
}

/// Like `try_request`, but runs on its own thread so the caller can
/// trigger a restart while the request is still in flight (used by the
/// overlapping-sleep scenario).
pub fn request_in_background(port: u16) -> std::thread::JoinHandle<Option<String>> {
    std::thread::spawn(move || try_request(port))
}

/// Copies the demo binary into a fresh temp directory and spawns it
/// from there. Fetch/swap scenarios must never run against the shared
/// `target/<profile>/relaunch-demo-echo` build artifact directly, since
/// a successful swap rewrites the file the master is executing from.
///
/// Returns the `TempDir` guard (keep it alive for the duration of the
/// test), the spawned `Child`, and the path the master is running from
/// (the same path a configured `FileFetcher` should eventually replace).
pub fn spawn_master_in_tempdir(
    port: u16,
    extra_env: &[(&str, &str)],
) -> (tempfile::TempDir, Child, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let binary_path = dir.path().join("relaunch-demo-echo");
    std::fs::copy(demo_binary_path(), &binary_path).expect("copy demo binary into temp dir");

    let mut perms = std::fs::metadata(&binary_path).unwrap().permissions();
    set_executable(&mut perms);
    std::fs::set_permissions(&binary_path, perms).unwrap();

    let mut command = Command::new(&binary_path);
    command
        .env("DEMO_ADDR", format!("127.0.0.1:{}", port))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    for (k, v) in extra_env {
        command.env(k, v);
    }
    let child = command.spawn().expect("spawn relaunch-demo-echo master");
    (dir, child, binary_path)
}

#[cfg(unix)]
fn set_executable(perms: &mut std::fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
}
