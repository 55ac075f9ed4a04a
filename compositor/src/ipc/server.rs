//! IPC server: Unix socket listener, per-client state and message framing.
//!
//! Frames are a 4-byte big-endian payload length followed by a UTF-8
//! s-expression. Clients must complete a `hello` handshake before any
//! other message is dispatched and before they receive events.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::{Interest, LoopHandle, Mode, PostAction};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::dispatch;
use crate::state::ImmersiveState;

/// Maximum message payload size (64 KiB; control messages are tiny).
const MAX_MESSAGE_SIZE: u32 = 65_536;

/// Maximum pending output before events are dropped (64 KiB).
const MAX_WRITE_BUFFER: usize = 65_536;

/// Default rate limit: messages per second per client. A slider drag
/// produces one message per UI frame.
const DEFAULT_RATE_LIMIT: u32 = 240;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds maximum message size")]
    Oversized(u32),
}

/// Split complete frames off the front of `buf`, leaving any partial frame.
pub fn decode_frames(buf: &mut Vec<u8>) -> Result<Vec<String>, FrameError> {
    let mut messages = Vec::new();
    while buf.len() >= 4 {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_MESSAGE_SIZE {
            return Err(FrameError::Oversized(len));
        }
        let total = 4 + len as usize;
        if buf.len() < total {
            break;
        }
        messages.push(String::from_utf8_lossy(&buf[4..total]).into_owned());
        buf.drain(..total);
    }
    Ok(messages)
}

/// Append one length-prefixed frame to `out`.
pub fn encode_frame(out: &mut Vec<u8>, payload: &str) {
    let bytes = payload.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Fixed-window per-client rate limiter.
pub struct RateLimiter {
    window_start: Instant,
    message_count: u32,
    pub max_per_second: u32,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            window_start: Instant::now(),
            message_count: 0,
            max_per_second,
        }
    }

    /// Count a message arriving at `now`; false once the window is full.
    pub fn check(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= RATE_LIMIT_WINDOW {
            self.window_start = now;
            self.message_count = 1;
            return true;
        }
        self.message_count += 1;
        self.message_count <= self.max_per_second
    }
}

/// Read the peer UID via SO_PEERCRED, or None where unsupported.
fn peer_uid(stream: &UnixStream) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        (ret == 0).then_some(cred.uid)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = stream;
        None
    }
}

/// Per-client IPC connection state.
pub struct IpcClient {
    pub stream: UnixStream,
    pub read_buf: Vec<u8>,
    pub write_buf: Vec<u8>,
    pub authenticated: bool,
    pub id: u64,
    pub peer_uid: Option<u32>,
    pub rate_limiter: RateLimiter,
}

impl IpcClient {
    pub fn new(stream: UnixStream, id: u64) -> Self {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(client_id = id, "failed to set non-blocking: {}", e);
        }
        let peer_uid = peer_uid(&stream);
        debug!(client_id = id, peer_uid = ?peer_uid, "peer credentials");
        Self {
            stream,
            read_buf: Vec::with_capacity(1024),
            write_buf: Vec::new(),
            authenticated: false,
            id,
            peer_uid,
            rate_limiter: RateLimiter::new(DEFAULT_RATE_LIMIT),
        }
    }

    /// Write as much pending output as the socket accepts.
    pub fn flush_writes(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero")),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn enqueue_message(&mut self, payload: &str) {
        encode_frame(&mut self.write_buf, payload);
    }

    /// Queue an event unless the client has stopped reading.
    pub fn enqueue_event(&mut self, payload: &str) {
        if self.write_buf.len() > MAX_WRITE_BUFFER {
            warn!(client_id = self.id, "write buffer overflow, dropping event");
            return;
        }
        self.enqueue_message(payload);
    }

    /// Drain readable bytes from the socket. Err means the client is gone.
    fn fill_read_buf(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::ConnectionReset, "eof")),
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// IPC server managing all client connections.
pub struct IpcServer {
    pub socket_path: PathBuf,
    pub clients: HashMap<u64, IpcClient>,
    next_client_id: u64,
    pub ipc_trace: bool,
}

impl IpcServer {
    /// Create the server state (does not bind; call `bind` after).
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            clients: HashMap::new(),
            next_client_id: 1,
            ipc_trace: false,
        }
    }

    /// `$XDG_RUNTIME_DIR/immersive-ipc.sock`, or a per-user /tmp path.
    pub fn default_socket_path() -> PathBuf {
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| format!("/tmp/immersive-{}", unsafe { libc::getuid() }));
        PathBuf::from(runtime_dir).join("immersive-ipc.sock")
    }

    /// Register a connected stream and return its client id.
    pub fn add_client(&mut self, stream: UnixStream) -> u64 {
        let client_id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(client_id, IpcClient::new(stream, client_id));
        client_id
    }

    /// Bind the listener socket and register it with calloop.
    pub fn bind(
        socket_path: &Path,
        loop_handle: &LoopHandle<'static, ImmersiveState>,
    ) -> anyhow::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o700))?;
        }

        info!(?socket_path, "IPC server listening");

        let source = Generic::new(listener, Interest::READ, Mode::Level);
        loop_handle
            .insert_source(source, |_event, listener, state| {
                loop {
                    match listener.as_ref().accept() {
                        Ok((stream, _addr)) => {
                            let client_id = state.ipc_server.add_client(stream);
                            info!(client_id, "IPC client connected");
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("accept error: {}", e);
                            break;
                        }
                    }
                }
                Ok(PostAction::Continue)
            })
            .map_err(|e| anyhow::anyhow!("failed to register IPC listener: {}", e.error))?;

        Ok(())
    }

    /// Read, dispatch and flush every client. Called once per loop iteration.
    pub fn poll_clients(state: &mut ImmersiveState) {
        let client_ids: Vec<u64> = state.ipc_server.clients.keys().copied().collect();
        let mut disconnected = Vec::new();

        for client_id in client_ids {
            let messages = {
                let Some(client) = state.ipc_server.clients.get_mut(&client_id) else {
                    continue;
                };
                // Frames read before EOF are still dispatched.
                if let Err(e) = client.fill_read_buf() {
                    debug!(client_id, "client disconnected: {}", e);
                    disconnected.push(client_id);
                }
                match decode_frames(&mut client.read_buf) {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(client_id, "protocol violation: {}", e);
                        if !disconnected.contains(&client_id) {
                            disconnected.push(client_id);
                        }
                        continue;
                    }
                }
            };

            for msg in messages {
                let now = Instant::now();
                let rate_ok = state
                    .ipc_server
                    .clients
                    .get_mut(&client_id)
                    .map(|c| c.rate_limiter.check(now))
                    .unwrap_or(false);

                let response = if rate_ok {
                    if state.ipc_server.ipc_trace {
                        info!(client_id, "<< {}", msg);
                    }
                    dispatch::handle_message(state, client_id, &msg)
                } else {
                    warn!(client_id, "rate limit exceeded, dropping message");
                    Some(dispatch::error_response(0, "rate limit exceeded"))
                };

                if let Some(resp) = response {
                    if state.ipc_server.ipc_trace {
                        info!(client_id, ">> {}", resp);
                    }
                    if let Some(client) = state.ipc_server.clients.get_mut(&client_id) {
                        client.enqueue_message(&resp);
                    }
                }
            }
        }

        for id in disconnected {
            info!(client_id = id, "removing disconnected IPC client");
            state.ipc_server.clients.remove(&id);
        }
        state.ipc_server.flush_all();
    }

    /// Flush pending output for every client, dropping broken connections.
    pub fn flush_all(&mut self) {
        let mut broken = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if let Err(e) = client.flush_writes() {
                debug!(client_id = *id, "write error: {}", e);
                broken.push(*id);
            }
        }
        for id in broken {
            info!(client_id = id, "removing disconnected IPC client");
            self.clients.remove(&id);
        }
    }

    /// Queue an event for every authenticated client.
    pub fn broadcast_event(&mut self, event: &str) {
        if self.ipc_trace {
            info!("broadcast >> {}", event);
        }
        for client in self.clients.values_mut() {
            if client.authenticated {
                client.enqueue_event(event);
            }
        }
    }

    /// Remove the socket file on shutdown.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("failed to remove IPC socket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_and_partial_frames() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, "(:type :ping)");
        encode_frame(&mut buf, "(:type :hello)");
        // Half of a third frame.
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"(:ty");

        let messages = decode_frames(&mut buf).unwrap();
        assert_eq!(messages, vec!["(:type :ping)", "(:type :hello)"]);
        assert_eq!(buf.len(), 8);

        buf.extend_from_slice(b"pe x)");
        buf.push(b' ');
        let messages = decode_frames(&mut buf).unwrap();
        assert_eq!(messages, vec!["(:type x) "]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        assert_eq!(
            decode_frames(&mut buf),
            Err(FrameError::Oversized(MAX_MESSAGE_SIZE + 1))
        );
    }

    #[test]
    fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(3);
        let t0 = Instant::now();
        assert!(limiter.check(t0));
        assert!(limiter.check(t0));
        assert!(limiter.check(t0));
        assert!(!limiter.check(t0));
        // A new window resets the count.
        assert!(limiter.check(t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn test_broadcast_only_reaches_authenticated_clients() {
        let mut server = IpcServer::new(PathBuf::from("/nonexistent/test.sock"));
        let (a, _peer_a) = UnixStream::pair().unwrap();
        let (b, _peer_b) = UnixStream::pair().unwrap();
        let id_a = server.add_client(a);
        let id_b = server.add_client(b);
        server.clients.get_mut(&id_a).unwrap().authenticated = true;

        server.broadcast_event("(:type :event :event :test)");
        assert!(!server.clients[&id_a].write_buf.is_empty());
        assert!(server.clients[&id_b].write_buf.is_empty());
    }

    #[test]
    fn test_messages_reach_peer_after_flush() {
        let mut server = IpcServer::new(PathBuf::from("/nonexistent/test.sock"));
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let id = server.add_client(ours);
        server.clients.get_mut(&id).unwrap().enqueue_message("(:ok t)");
        server.flush_all();

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
        assert_eq!(decode_frames(&mut received).unwrap(), vec!["(:ok t)"]);
    }

    #[test]
    fn test_frames_before_eof_are_dispatched() {
        use crate::state::tests::test_state;
        use crate::vr::immersion::SessionPhase;

        let mut state = test_state();
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let id = state.ipc_server.add_client(ours);

        let mut out = Vec::new();
        encode_frame(&mut out, "(:type :hello :id 1 :version 1)");
        encode_frame(&mut out, "(:type :immersive-space-toggle :id 2 :enable t)");
        peer.write_all(&out).unwrap();
        drop(peer);

        IpcServer::poll_clients(&mut state);
        assert_eq!(state.controller.phase(), SessionPhase::RequestingOpen);
        assert!(!state.ipc_server.clients.contains_key(&id));
    }

    #[test]
    fn test_peer_uid_matches_own_uid() {
        let (a, _b) = UnixStream::pair().unwrap();
        let client = IpcClient::new(a, 1);
        if cfg!(target_os = "linux") {
            assert_eq!(client.peer_uid, Some(unsafe { libc::getuid() }));
        }
    }
}
