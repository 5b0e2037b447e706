//! Control socket listener and event loop
//!
//! A UNIX-domain stream socket in the filesystem namespace (mode 0666,
//! `SO_PEERCRED` gates privileged commands) or the abstract namespace
//! (names starting with `@`). The poll loop owns three reserved slots
//! (listening socket, inotify, signalfd) followed by one slot per client;
//! the array grows in 4096-byte chunks up to a hard client ceiling, and at
//! the ceiling the listening slot is disarmed so new connections stall
//! instead of exhausting memory.
//!
//! Signals are consumed as messages: INT/TERM/HUP/USR1 are blocked and
//! surface through a signalfd slot in the same poll loop. One inotify
//! instance watches the main config file and the config directory; any
//! event asks the operator to reload.

use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::sockopt::PeerCredentials;
use nix::sys::socket::{self, getsockopt, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use parking_lot::Mutex;

use mpath_core::error::{CoreError, CoreResult};

use crate::cli::{uxsock_trigger, ClientAction};
use crate::daemon::{reconfigure, DaemonCtx};
use crate::protocol::{recv_packet, send_packet};

/// Reserved poll slots: listener, inotify, signalfd.
const POLLFDS_BASE: usize = 3;
const POLLFD_CHUNK: usize = 4096 / std::mem::size_of::<libc::pollfd>();
/// Hard ceiling on concurrent client connections.
pub const MAX_CLIENTS: usize = 16384 - POLLFDS_BASE;
/// Bound on a single command packet.
const MAX_CMD_LEN: usize = 8192;

/// Where one client connection currently is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Recv,
    Parse,
    WaitLock,
    Work,
    Send,
}

struct Client {
    stream: UnixStream,
    is_root: bool,
    state: ClientState,
}

#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Listener,
    Notify,
    Signal,
    Client(usize),
}

enum Fate {
    Keep,
    Drop,
    Shutdown,
}

fn nix_io(e: Errno, what: &str) -> CoreError {
    CoreError::Io {
        path: None,
        kind: io::Error::from_raw_os_error(e as i32).kind(),
        message: format!("{}: {}", what, e),
    }
}

/// Create the listening socket. Names starting with `@` bind in the
/// abstract namespace; filesystem sockets get mode 0666 (peer credentials,
/// not file permissions, protect privileged commands).
pub fn ux_socket_listen(name: &str) -> CoreResult<UnixListener> {
    if let Some(abstract_name) = name.strip_prefix('@') {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| nix_io(e, "create control socket"))?;
        let addr = UnixAddr::new_abstract(abstract_name.as_bytes())
            .map_err(|e| nix_io(e, "abstract socket address"))?;
        socket::bind(fd.as_raw_fd(), &addr).map_err(|e| nix_io(e, "bind control socket"))?;
        socket::listen(&fd, Backlog::new(10).unwrap_or(Backlog::MAXCONN))
            .map_err(|e| nix_io(e, "listen on control socket"))?;
        Ok(UnixListener::from(fd))
    } else {
        let path = FsPath::new(name);
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to unlink {}: {}", name, e),
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| CoreError::io(path, e, "bind control socket"))?;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            debug!("failed to set permissions on {}: {}", name, e);
        }
        Ok(listener)
    }
}

/// Block the signals the event loop consumes through its signalfd. Must
/// run before worker threads are spawned so they inherit the mask.
pub fn block_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGUSR1);
    if let Err(e) = mask.thread_block() {
        warn!("cannot block signals: {}", e);
    }
    mask
}

struct WatchDescriptors {
    conf_wd: Option<WatchDescriptor>,
    dir_wd: Option<WatchDescriptor>,
}

/// Re-resolve the inotify watches when the configuration sequence number
/// advanced. Failing to arm a watch only costs the operator a reload hint.
fn reset_watch(
    notify: &Inotify,
    wds: &mut WatchDescriptors,
    ctx: &DaemonCtx,
    sequence_nr: &mut u32,
) {
    let (conf_seq, config_dir) = {
        let conf = ctx.conf.read();
        (conf.sequence_nr, conf.config_dir.clone())
    };
    if *sequence_nr == conf_seq {
        return;
    }
    *sequence_nr = conf_seq;

    if let Some(wd) = wds.conf_wd.take() {
        let _ = notify.rm_watch(wd);
    }
    if let Some(wd) = wds.dir_wd.take() {
        let _ = notify.rm_watch(wd);
    }
    wds.conf_wd = match notify.add_watch(&ctx.config_file, AddWatchFlags::IN_CLOSE_WRITE) {
        Ok(wd) => Some(wd),
        Err(e) => {
            debug!(
                "didn't set up notifications on {}: {}",
                ctx.config_file.display(),
                e
            );
            None
        }
    };
    wds.dir_wd = match notify.add_watch(
        &config_dir,
        AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_ONLYDIR,
    ) {
        Ok(wd) => Some(wd),
        Err(e) => {
            debug!(
                "didn't set up notifications on {}: {}",
                config_dir.display(),
                e
            );
            None
        }
    };
}

fn handle_inotify(notify: &Inotify, wds: &mut WatchDescriptors, ctx: &DaemonCtx) {
    let mut got_notify = false;
    loop {
        match notify.read_events() {
            Ok(events) => {
                if events.is_empty() {
                    break;
                }
                got_notify = true;
                for event in events {
                    if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                        // the config file may have been replaced; try once
                        // to re-arm the watch
                        if wds.conf_wd == Some(event.wd) {
                            wds.conf_wd = notify
                                .add_watch(&ctx.config_file, AddWatchFlags::IN_CLOSE_WRITE)
                                .ok();
                        } else if wds.dir_wd == Some(event.wd) {
                            wds.dir_wd = None;
                        }
                    }
                }
            }
            Err(Errno::EAGAIN) => break,
            Err(e) => {
                debug!("error reading from inotify fd: {}", e);
                if let Some(wd) = wds.conf_wd.take() {
                    let _ = notify.rm_watch(wd);
                }
                if let Some(wd) = wds.dir_wd.take() {
                    let _ = notify.rm_watch(wd);
                }
                break;
            }
        }
    }
    if got_notify {
        warn!("Multipath configuration updated.\nReload multipathd for changes to take effect");
    }
}

/// Drain the signalfd. Returns true when a termination signal arrived.
fn handle_signals(ctx: &DaemonCtx, signal_fd: &mut SignalFd) -> bool {
    let mut shutdown = false;
    while let Ok(Some(si)) = signal_fd.read_signal() {
        let signo = si.ssi_signo as i32;
        if signo == Signal::SIGHUP as i32 {
            info!("SIGHUP received, reconfiguring");
            if let Err(e) = reconfigure(ctx) {
                warn!("reconfigure failed: {}", e);
            }
        } else if signo == Signal::SIGUSR1 as i32 {
            let vecs = ctx.vecs.read();
            info!(
                "SIGUSR1: {} maps, {} paths",
                vecs.maps.len(),
                vecs.paths.len()
            );
        } else if signo == Signal::SIGINT as i32 || signo == Signal::SIGTERM as i32 {
            info!("exit (signal {})", signo);
            shutdown = true;
        }
    }
    shutdown
}

fn accept_clients(listener: &UnixListener, clients: &mut Vec<Client>) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                // treat a credentials error as an unprivileged peer
                let is_root = getsockopt(&stream, PeerCredentials)
                    .map(|cred| cred.uid() == 0)
                    .unwrap_or(false);
                debug!("cli[{}]: connected, root={}", stream.as_raw_fd(), is_root);
                clients.push(Client {
                    stream,
                    is_root,
                    state: ClientState::Recv,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("accept failed: {}", e);
                break;
            }
        }
    }
}

fn handle_client(ctx: &DaemonCtx, client: &mut Client, revents: PollFlags) -> Fate {
    if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
        debug!(
            "cli[{}]: disconnected in state {:?}",
            client.stream.as_raw_fd(),
            client.state
        );
        return Fate::Drop;
    }
    if !revents.contains(PollFlags::POLLIN) {
        return Fate::Keep;
    }

    client.state = ClientState::Recv;
    let timeout = ctx.conf.read().uxsock_timeout;
    let _ = client
        .stream
        .set_read_timeout(Some(Duration::from_millis(timeout as u64)));
    let cmd = match recv_packet(&mut client.stream, MAX_CMD_LEN) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return Fate::Drop,
        Err(e) => {
            debug!("cli[{}]: receive failed: {}", client.stream.as_raw_fd(), e);
            return Fate::Drop;
        }
    };
    debug!("cli[{}]: got request [{}]", client.stream.as_raw_fd(), cmd);

    client.state = ClientState::Parse;
    client.state = ClientState::WaitLock;
    let reply = uxsock_trigger(ctx, &cmd, client.is_root);
    client.state = ClientState::Work;

    client.state = ClientState::Send;
    if let Err(e) = send_packet(&mut client.stream, &reply.text) {
        debug!("cli[{}]: send failed: {}", client.stream.as_raw_fd(), e);
        return Fate::Drop;
    }
    debug!(
        "cli[{}]: reply [{} bytes]",
        client.stream.as_raw_fd(),
        reply.text.len()
    );
    client.state = ClientState::Recv;

    match reply.action {
        ClientAction::None => Fate::Keep,
        ClientAction::CloseClient => Fate::Drop,
        ClientAction::ShutdownDaemon => Fate::Shutdown,
    }
}

/// The event loop. Returns when shutdown is requested (command or signal)
/// or on a fatal poll error.
pub fn run_listener(ctx: Arc<DaemonCtx>, socket_name: &str) -> CoreResult<()> {
    info!("uxsock: startup listener");
    let listener = ux_socket_listen(socket_name)?;
    listener
        .set_nonblocking(true)
        .map_err(|e| CoreError::from(e))?;

    let mask = block_signals();
    let mut signal_fd =
        match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(sfd) => Some(sfd),
            Err(e) => {
                warn!("cannot create signalfd: {}", e);
                None
            }
        };
    let notify = match Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC) {
        Ok(n) => Some(n),
        Err(e) => {
            debug!("failed to start up configuration notifications: {}", e);
            None
        }
    };
    let mut wds = WatchDescriptors {
        conf_wd: None,
        dir_wd: None,
    };
    let mut sequence_nr: u32 = 0;
    let clients: Mutex<Vec<Client>> = Mutex::new(Vec::new());
    let mut max_pfds = POLLFD_CHUNK;

    loop {
        if ctx.is_shutdown() {
            break;
        }
        if let Some(n) = &notify {
            reset_watch(n, &mut wds, &ctx, &mut sequence_nr);
        }

        let mut guard = clients.lock();
        let num_clients = guard.len();
        while num_clients + POLLFDS_BASE > max_pfds {
            max_pfds += POLLFD_CHUNK;
        }

        let mut fds: Vec<PollFd> = Vec::with_capacity(max_pfds.min(num_clients + POLLFDS_BASE));
        let mut kinds: Vec<SlotKind> = Vec::with_capacity(fds.capacity());
        if num_clients < MAX_CLIENTS {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            kinds.push(SlotKind::Listener);
        } else {
            warn!("max client connections reached, pausing polling");
        }
        if let Some(n) = &notify {
            let events = if wds.conf_wd.is_none() && wds.dir_wd.is_none() {
                PollFlags::empty()
            } else {
                PollFlags::POLLIN
            };
            fds.push(PollFd::new(n.as_fd(), events));
            kinds.push(SlotKind::Notify);
        }
        if let Some(sfd) = &signal_fd {
            fds.push(PollFd::new(sfd.as_fd(), PollFlags::POLLIN));
            kinds.push(SlotKind::Signal);
        }
        for (i, client) in guard.iter().enumerate() {
            fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLIN));
            kinds.push(SlotKind::Client(i));
        }

        // most of the daemon's life is spent here
        let rv = poll(&mut fds, PollTimeout::from(1000u16));
        let ready: Vec<(SlotKind, PollFlags)> = fds
            .iter()
            .zip(kinds.iter())
            .filter_map(|(fd, kind)| {
                fd.revents()
                    .filter(|r| !r.is_empty())
                    .map(|r| (*kind, r))
            })
            .collect();
        drop(fds);

        match rv {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("uxsock: poll failed: {}", e);
                return Err(CoreError::Fatal {
                    reason: format!("poll failed: {}", e),
                });
            }
            Ok(_) => {}
        }

        let mut accept_new = false;
        let mut notify_in = false;
        let mut shutdown = false;
        let mut dead: Vec<usize> = Vec::new();
        for (kind, revents) in ready {
            match kind {
                SlotKind::Listener => accept_new = true,
                SlotKind::Notify => notify_in = true,
                SlotKind::Signal => {
                    if let Some(sfd) = signal_fd.as_mut() {
                        if handle_signals(&ctx, sfd) {
                            shutdown = true;
                        }
                    }
                }
                SlotKind::Client(i) => match handle_client(&ctx, &mut guard[i], revents) {
                    Fate::Keep => {}
                    Fate::Drop => dead.push(i),
                    Fate::Shutdown => shutdown = true,
                },
            }
        }
        for i in dead.into_iter().rev() {
            guard.remove(i);
        }
        if accept_new {
            accept_clients(&listener, &mut guard);
        }
        drop(guard);

        if notify_in {
            if let Some(n) = &notify {
                handle_inotify(n, &mut wds, &ctx);
            }
        }
        if shutdown {
            ctx.request_shutdown();
        }
    }

    info!("uxsock: shutting down");
    if !socket_name.starts_with('@') {
        let _ = std::fs::remove_file(socket_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_socket_permissions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mpathd.sock");
        let name = path.to_string_lossy().into_owned();
        let _listener = ux_socket_listen(&name).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        // a stale socket file is replaced, not an error
        drop(_listener);
        let again = ux_socket_listen(&name);
        assert!(again.is_ok());
    }

    #[test]
    fn test_abstract_socket_accepts_connections() {
        let name = format!("@mpathd-test-{}", std::process::id());
        let listener = ux_socket_listen(&name).unwrap();

        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        let addr = UnixAddr::new_abstract(name[1..].as_bytes()).unwrap();
        socket::connect(fd.as_raw_fd(), &addr).unwrap();

        let (peer, _) = listener.accept().unwrap();
        let cred = getsockopt(&peer, PeerCredentials).unwrap();
        assert_eq!(cred.pid(), std::process::id() as i32);
    }
}
