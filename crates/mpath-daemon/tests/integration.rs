//! End-to-end tests over a real control socket: a listener thread with the
//! in-memory kernel collaborators, clients speaking the length-prefixed
//! protocol.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mpath_core::config::Config;
use mpath_core::dm::{MemoryDm, MemorySysfs, PathSeed};
use mpath_daemon::daemon::DaemonCtx;
use mpath_daemon::listener::run_listener;
use mpath_daemon::protocol::{recv_packet, send_packet};

fn seed(dev: &str, dev_t: &str, wwid: &str) -> PathSeed {
    PathSeed {
        dev: dev.to_string(),
        dev_t: dev_t.to_string(),
        wwid: wwid.to_string(),
        size: 4096,
        ..Default::default()
    }
}

fn start_daemon(dir: &tempfile::TempDir) -> (Arc<DaemonCtx>, String, thread::JoinHandle<()>) {
    let mut conf = Config::builtin();
    conf.bindings_file = dir.path().join("bindings");
    conf.prkeys_file = dir.path().join("prkeys");
    conf.config_dir = dir.path().join("conf.d");
    conf.defaults.checker_name = Some("none".to_string());

    let sysfs = MemorySysfs::new();
    sysfs.add_dev(seed("sda", "8:0", "WW1"));
    sysfs.add_dev(seed("sdb", "8:16", "WW1"));

    let ctx = DaemonCtx::new(
        conf,
        dir.path().join("multipath.conf"),
        Box::new(MemoryDm::new()),
        Box::new(sysfs),
    );
    let socket_name = dir.path().join("mpathd.sock").to_string_lossy().into_owned();

    let listener_ctx = Arc::clone(&ctx);
    let listener_sock = socket_name.clone();
    let handle = thread::spawn(move || {
        run_listener(listener_ctx, &listener_sock).expect("listener failed");
    });

    (ctx, socket_name, handle)
}

fn connect(socket_name: &str) -> UnixStream {
    for _ in 0..200 {
        if Path::new(socket_name).exists() {
            if let Ok(stream) = UnixStream::connect(socket_name) {
                return stream;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("control socket {} never came up", socket_name);
}

fn roundtrip(stream: &mut UnixStream, cmd: &str) -> String {
    send_packet(stream, cmd).unwrap();
    recv_packet(stream, 0).unwrap().expect("daemon closed connection")
}

fn is_root() -> bool {
    // SAFETY: geteuid has no failure modes
    unsafe { libc::geteuid() == 0 }
}

#[test]
fn control_socket_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let (ctx, socket_name, handle) = start_daemon(&dir);
    let mut stream = connect(&socket_name);

    let reply = roundtrip(&mut stream, "list paths");
    assert!(reply.starts_with("dev"), "unexpected reply: {}", reply);

    let reply = roundtrip(&mut stream, "add path sda");
    if is_root() {
        assert_eq!(reply, "ok\n");
        let reply = roundtrip(&mut stream, "add path sdb");
        assert_eq!(reply, "ok\n");

        let reply = roundtrip(&mut stream, "list maps");
        assert!(reply.contains("WW1"), "map missing from: {}", reply);

        let reply = roundtrip(&mut stream, "show map WW1");
        assert!(reply.contains("wwid: WW1"));
    } else {
        assert_eq!(reply, "permission deny: need to be root\n");
        // list is still served
        let reply = roundtrip(&mut stream, "list maps");
        assert!(reply.starts_with("name"));
    }

    let reply = roundtrip(&mut stream, "show config");
    assert!(reply.contains("defaults {"));

    if is_root() {
        let reply = roundtrip(&mut stream, "shutdown");
        assert_eq!(reply, "ok\n");
        handle.join().unwrap();
        assert!(ctx.is_shutdown());
        assert!(!Path::new(&socket_name).exists());
    } else {
        ctx.request_shutdown();
        handle.join().unwrap();
    }
}

#[test]
fn several_clients_and_quit() {
    let dir = tempfile::TempDir::new().unwrap();
    let (ctx, socket_name, handle) = start_daemon(&dir);

    let mut first = connect(&socket_name);
    let mut second = connect(&socket_name);

    let reply = roundtrip(&mut second, "list paths");
    assert!(reply.starts_with("dev"));
    let reply = roundtrip(&mut first, "list maps");
    assert!(reply.starts_with("name"));

    // quit closes only that client
    send_packet(&mut first, "quit").unwrap();
    let reply = recv_packet(&mut first, 0).unwrap();
    assert_eq!(reply.as_deref(), Some("ok\n"));
    let eof = recv_packet(&mut first, 0).unwrap();
    assert_eq!(eof, None);

    // the other client keeps working
    let reply = roundtrip(&mut second, "list paths");
    assert!(reply.starts_with("dev"));

    ctx.request_shutdown();
    handle.join().unwrap();
}

#[test]
fn oversized_command_drops_client() {
    let dir = tempfile::TempDir::new().unwrap();
    let (ctx, socket_name, handle) = start_daemon(&dir);
    let mut stream = connect(&socket_name);

    let huge = "x".repeat(64 * 1024);
    send_packet(&mut stream, &huge).unwrap();
    // the daemon refuses the packet and drops the connection; depending on
    // timing the client sees a clean EOF or a reset
    let reply = recv_packet(&mut stream, 0);
    assert!(matches!(reply, Ok(None) | Err(_)), "got {:?}", reply);

    // new connections still work
    let mut fresh = connect(&socket_name);
    let reply = roundtrip(&mut fresh, "list paths");
    assert!(reply.starts_with("dev"));

    ctx.request_shutdown();
    handle.join().unwrap();
}
