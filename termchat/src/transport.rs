//! Connection endpoint: one stream per endpoint, handshake by role, then the receive loop.
//!
//! A listener accepts TCP connections but serves only one at a time; extra connections are
//! closed on accept. A joiner dials TCP or attaches any already-open byte stream.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use termchat_core::{
    decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, Handshake, HandshakeError,
    Kind, Message, Role, Session, SessionState, Transition, MAX_FRAME_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Upper bound on `stop` taking the writer and sending Leave.
const LEAVE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Notifications for the UI side. `Connected` and `Disconnected` are each sent at most once.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    /// Every steady-state message received, Ping included.
    Message(Message),
    Disconnected,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("session is not active")]
    NotActive,
    #[error("already connected")]
    AlreadyConnected,
    #[error("already listening")]
    AlreadyListening,
    #[error("operation not available to a {0:?} endpoint")]
    WrongRole(Role),
    #[error("endpoint stopped")]
    Stopped,
}

/// State shared between the endpoint handle and its background tasks.
struct Shared {
    session: Arc<Session>,
    /// The attached stream's write half. `Some` means a stream is attached; guards attach,
    /// detach and every frame write.
    writer: Mutex<Option<BoxedWriter>>,
    events: mpsc::UnboundedSender<Event>,
    /// Flips to true once; closes the accept loop and unblocks pending reads and writes.
    shutdown: watch::Sender<bool>,
    /// Set by `Endpoint::stop`, which then owns closing the write half.
    stopping: AtomicBool,
}

impl Shared {
    /// Write one frame under the writer lock. Logged sends are appended to the session
    /// while the lock is still held so the log matches wire order.
    ///
    /// A write still pending at shutdown is abandoned and the write half is dropped, since
    /// a partial frame may already be on the wire.
    async fn send(&self, msg: Message, log: bool) -> Result<(), EndpointError> {
        let frame = encode_frame(&msg)?;
        let mut shutdown = self.shutdown.subscribe();
        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(EndpointError::NotConnected)?;
        let written = tokio::select! {
            res = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => Some(res),
            _ = shutdown.wait_for(|stopped| *stopped) => None,
        };
        match written {
            Some(res) => res?,
            None => {
                slot.take();
                return Err(EndpointError::Stopped);
            }
        }
        if log {
            self.session.add_message(msg);
        }
        Ok(())
    }

    /// Detach and close the write half, if any.
    async fn detach(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    /// Handshake done: mark Active and notify. False if the session already ended.
    fn activate(&self) -> bool {
        if !self.session.advance(SessionState::Active) {
            return false;
        }
        let _ = self.events.send(Event::Connected);
        true
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receive loop exit: the only place `Disconnected` is sent.
    async fn release(&self) {
        self.shutdown.send_replace(true);
        if !self.stopping.load(Ordering::Acquire) {
            self.detach().await;
        }
        self.session.advance(SessionState::Ended);
        let _ = self.events.send(Event::Disconnected);
    }
}

/// Incremental frame reader over the read half of a stream.
struct FrameReader {
    inner: BoxedReader,
    buf: Vec<u8>,
    /// Length of the prefix of `buf` known to hold no delimiter.
    scanned: usize,
}

impl FrameReader {
    fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Next message, or `None` when the stream ends cleanly between frames.
    /// Cancel-safe: bytes already read stay buffered. Each byte is searched for the
    /// delimiter once.
    async fn next_frame(&mut self) -> Result<Option<Message>, EndpointError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                let end = self.scanned + pos + 1;
                self.scanned = 0;
                let decoded = decode_frame(&self.buf[..end]);
                self.buf.drain(..end);
                return Ok(Some(decoded?.0));
            }
            self.scanned = self.buf.len();
            if self.scanned > MAX_FRAME_LEN {
                return Err(FrameDecodeError::TooLarge.into());
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(FrameDecodeError::Truncated.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// One chat endpoint, parameterized by role. Steady-state and teardown logic is shared.
pub struct Endpoint {
    role: Role,
    shared: Arc<Shared>,
    handshake_timeout: Option<Duration>,
    listening: AtomicBool,
}

impl Endpoint {
    /// New endpoint and the receiver for its events.
    pub fn new(role: Role, session: Arc<Session>) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            session,
            writer: Mutex::new(None),
            events,
            shutdown,
            stopping: AtomicBool::new(false),
        });
        let endpoint = Self {
            role,
            shared,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            listening: AtomicBool::new(false),
        };
        (endpoint, rx)
    }

    pub fn listener(session: Arc<Session>) -> (Self, EventReceiver) {
        Self::new(Role::Listener, session)
    }

    pub fn joiner(session: Arc<Session>) -> (Self, EventReceiver) {
        Self::new(Role::Joiner, session)
    }

    /// Bound each handshake read; `None` waits indefinitely.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// Whether a stream is currently attached (handshaking or active).
    pub async fn is_attached(&self) -> bool {
        self.shared.writer.lock().await.is_some()
    }

    /// Listener: bind, move the session to Waiting, and accept peers in the background.
    /// Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, EndpointError> {
        self.require(Role::Listener)?;
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(EndpointError::AlreadyListening);
        }
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.listening.store(false, Ordering::Release);
                return Err(EndpointError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };
        let local = listener.local_addr()?;
        self.shared.session.advance(SessionState::Waiting);
        info!(%local, session = %self.shared.session.id(), "listening");
        tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.handshake_timeout,
        ));
        Ok(local)
    }

    /// Joiner: dial `addr` over TCP and run the handshake.
    pub async fn connect(&self, addr: &str) -> Result<(), EndpointError> {
        self.require(Role::Joiner)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| EndpointError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        self.join_stream(stream).await
    }

    /// Joiner: run the handshake over an already-open stream (TCP, tunnel, in-memory pipe).
    /// On success the receive loop runs in the background and this returns immediately.
    pub async fn join_stream<S>(&self, stream: S) -> Result<(), EndpointError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.require(Role::Joiner)?;
        let (reader, writer) = tokio::io::split(stream);
        {
            let mut slot = self.shared.writer.lock().await;
            if slot.is_some() {
                return Err(EndpointError::AlreadyConnected);
            }
            *slot = Some(Box::new(writer));
        }
        let mut reader = FrameReader::new(Box::new(reader));
        let outcome = handshake(&self.shared, &mut reader, self.role, self.handshake_timeout).await;
        if let Err(e) = outcome {
            warn!(session = %self.shared.session.id(), error = %e, "join failed");
            self.shared.detach().await;
            return Err(e);
        }
        if !self.shared.activate() {
            self.shared.detach().await;
            return Err(EndpointError::Stopped);
        }
        info!(session = %self.shared.session.id(), "joined session");
        tokio::spawn(receive_loop(self.shared.clone(), reader));
        Ok(())
    }

    /// Write one message to the peer and append it to the session log.
    /// Only an Active session carries chat traffic.
    pub async fn send_message(&self, msg: Message) -> Result<(), EndpointError> {
        if self.shared.session.state() != SessionState::Active {
            return Err(EndpointError::NotActive);
        }
        self.shared.send(msg, true).await
    }

    /// Mark the session Ended, close the listener, then send a best-effort Leave and close
    /// the stream. Returns within `LEAVE_WRITE_TIMEOUT` even if the peer stopped reading.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.session.advance(SessionState::Ended);

        let session = &self.shared.session;
        let farewell = async {
            let Some(mut writer) = self.shared.writer.lock().await.take() else {
                return;
            };
            let leave = Message::control(Kind::Leave);
            match encode_frame(&leave) {
                Ok(frame) => {
                    let sent = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    };
                    match sent.await {
                        Ok(()) => session.add_message(leave),
                        Err(e) => debug!(error = %e, "leave not sent"),
                    }
                }
                Err(e) => debug!(error = %e, "leave not encoded"),
            }
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(LEAVE_WRITE_TIMEOUT, farewell).await.is_err() {
            debug!("leave write timed out");
        }
        info!(session = %session.id(), "stopped");
    }

    fn require(&self, role: Role) -> Result<(), EndpointError> {
        if self.role != role {
            return Err(EndpointError::WrongRole(self.role));
        }
        if self.shared.stopping.load(Ordering::Acquire) || self.shared.is_shut_down() {
            return Err(EndpointError::Stopped);
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// Accept peers until shutdown. A connection arriving while another is attached is dropped
/// before any handshake.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, timeout: Option<Duration>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = tokio::io::split(stream);
        {
            let mut slot = shared.writer.lock().await;
            if shared.is_shut_down() {
                debug!(%peer, "rejecting connection: endpoint is shutting down");
                break;
            }
            if slot.is_some() {
                debug!(%peer, "rejecting connection: a peer is already attached");
                continue;
            }
            *slot = Some(Box::new(writer));
        }
        debug!(%peer, "accepted connection");
        tokio::spawn(serve_peer(
            shared.clone(),
            FrameReader::new(Box::new(reader)),
            peer,
            timeout,
        ));
    }
    debug!("accept loop finished");
}

/// Listener side of one accepted stream. A failed handshake frees the slot and leaves the
/// session Waiting.
async fn serve_peer(
    shared: Arc<Shared>,
    mut reader: FrameReader,
    peer: SocketAddr,
    timeout: Option<Duration>,
) {
    if let Err(e) = handshake(&shared, &mut reader, Role::Listener, timeout).await {
        warn!(%peer, error = %e, "handshake failed");
        shared.detach().await;
        return;
    }
    if !shared.activate() {
        shared.detach().await;
        return;
    }
    info!(%peer, session = %shared.session.id(), "peer connected");
    receive_loop(shared, reader).await;
}

/// Drive the handshake for `role` until Active or failure. All writes go through the writer lock.
async fn handshake(
    shared: &Shared,
    reader: &mut FrameReader,
    role: Role,
    timeout: Option<Duration>,
) -> Result<(), EndpointError> {
    let mut machine = Handshake::new(role, shared.session.id());
    if let Some(hello) = machine.opening() {
        shared.send(hello, false).await?;
    }
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let msg = match read_handshake_frame(reader, &mut shutdown, timeout).await {
            Ok(msg) => msg,
            Err(EndpointError::Handshake(e)) => return Err(machine.abort(e).into()),
            Err(e) => {
                machine.abort(HandshakeError::Closed);
                return Err(e);
            }
        };
        match machine.on_message(&msg) {
            Ok(Transition::Send(reply)) => shared.send(reply, false).await?,
            Ok(Transition::SendAndActivate(reply)) => {
                shared.send(reply, false).await?;
                break;
            }
            Ok(Transition::Activate) => break,
            Err(rejection) => {
                if let Some(notice) = rejection.notice {
                    if let Err(e) = shared.send(notice, false).await {
                        debug!(error = %e, "could not send handshake rejection");
                    }
                }
                return Err(rejection.error.into());
            }
        }
    }
    debug!(role = ?machine.role(), session = %shared.session.id(), "handshake complete");
    Ok(())
}

async fn read_handshake_frame(
    reader: &mut FrameReader,
    shutdown: &mut watch::Receiver<bool>,
    timeout: Option<Duration>,
) -> Result<Message, EndpointError> {
    let read = async {
        tokio::select! {
            res = reader.next_frame() => {
                res?.ok_or_else(|| EndpointError::from(HandshakeError::Closed))
            }
            _ = shutdown.wait_for(|stopped| *stopped) => Err(EndpointError::Stopped),
        }
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| EndpointError::from(HandshakeError::TimedOut))?,
        None => read.await,
    }
}

/// Steady state: log, notify, answer Ping, stop on Leave, end of stream, decode error or shutdown.
async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let mut shutdown = shared.shutdown.subscribe();
    let reason = loop {
        let msg = tokio::select! {
            res = reader.next_frame() => match res {
                Ok(Some(msg)) => msg,
                Ok(None) => break "peer closed the stream",
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    break "receive error";
                }
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break "stopped locally",
        };
        let kind = msg.kind;
        shared.session.add_message(msg.clone());
        let _ = shared.events.send(Event::Message(msg));
        match kind {
            Kind::Ping => {
                if let Err(e) = shared.send(Message::control(Kind::Pong), true).await {
                    warn!(error = %e, "pong not sent");
                }
            }
            Kind::Leave => break "peer left",
            _ => {}
        }
    };
    info!(
        session = %shared.session.id(),
        reason,
        messages = shared.session.message_count(),
        "connection closed"
    );
    drop(reader);
    shared.release().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut EventReceiver) -> Event {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Next non-message event (skips Message events).
    async fn next_state_event(rx: &mut EventReceiver) -> Event {
        loop {
            match next_event(rx).await {
                Event::Message(_) => continue,
                other => return other,
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn start_listener(id: &str) -> (Endpoint, EventReceiver, SocketAddr) {
        let (listener, rx) = Endpoint::listener(Arc::new(Session::new(id)));
        let addr = listener.listen("127.0.0.1:0").await.unwrap();
        (listener, rx, addr)
    }

    async fn connected_pair(
        id: &str,
    ) -> (Endpoint, EventReceiver, Endpoint, EventReceiver, SocketAddr) {
        let (listener, mut lrx, addr) = start_listener(id).await;
        let (joiner, mut jrx) = Endpoint::joiner(Arc::new(Session::new(id)));
        joiner.connect(&addr.to_string()).await.unwrap();
        assert!(matches!(next_event(&mut jrx).await, Event::Connected));
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
        (listener, lrx, joiner, jrx, addr)
    }

    async fn read_msg(reader: &mut BufReader<OwnedReadHalf>) -> Message {
        let mut line = String::new();
        tokio::time::timeout(WAIT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        decode_frame(line.as_bytes()).unwrap().0
    }

    fn slot_is_free(endpoint: &Endpoint) -> bool {
        endpoint
            .shared
            .writer
            .try_lock()
            .map(|w| w.is_none())
            .unwrap_or(false)
    }

    fn slot_is_taken(endpoint: &Endpoint) -> bool {
        endpoint
            .shared
            .writer
            .try_lock()
            .map(|w| w.is_some())
            .unwrap_or(false)
    }

    /// Plain TCP peer that sends Hello and reads the Welcome, but not yet Ready.
    async fn raw_joiner(addr: SocketAddr, id: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read_half);
        let hello = encode_frame(&Message::handshake(Kind::Hello, id)).unwrap();
        write_half.write_all(&hello).await.unwrap();
        let welcome = read_msg(&mut reader).await;
        assert_eq!(welcome.kind, Kind::Welcome);
        (reader, write_half)
    }

    async fn send_ready(writer: &mut OwnedWriteHalf) {
        let ready = encode_frame(&Message::control(Kind::Ready)).unwrap();
        writer.write_all(&ready).await.unwrap();
    }

    /// Connection to `addr` is refused, or closed without a single byte after Hello.
    async fn assert_turned_away(addr: SocketAddr, id: &str) {
        let Ok(mut stream) = TcpStream::connect(addr).await else {
            return;
        };
        let hello = encode_frame(&Message::handshake(Kind::Hello, id)).unwrap();
        let _ = stream.write_all(&hello).await;
        let mut buf = [0u8; 256];
        let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("connection was neither served nor closed");
        match read {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!(
                "connection was served: {}",
                String::from_utf8_lossy(&buf[..n])
            ),
        }
    }

    /// Send bulk text until a write stops completing because the peer does not read.
    async fn fill_peer_window(endpoint: &Endpoint) {
        let bulk = "x".repeat(256 * 1024);
        loop {
            let send = endpoint.send_message(Message::text(bulk.clone()));
            match tokio::time::timeout(Duration::from_millis(200), send).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => panic!("send failed before the window filled: {e}"),
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn handshake_activates_both_sides_once() {
        let (listener, mut lrx, joiner, mut jrx, _) = connected_pair("nova-42").await;
        assert_eq!(listener.session().state(), SessionState::Active);
        assert_eq!(joiner.session().state(), SessionState::Active);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lrx.try_recv().is_err());
        assert!(jrx.try_recv().is_err());
        // Handshake frames are not part of the log.
        assert!(listener.session().messages().is_empty());
        assert!(joiner.session().messages().is_empty());
    }

    #[tokio::test]
    async fn text_reaches_peer_and_stop_ends_both() {
        let (listener, mut lrx, joiner, mut jrx, _) = connected_pair("nova-42").await;

        joiner.send_message(Message::text("hi")).await.unwrap();
        match next_event(&mut lrx).await {
            Event::Message(msg) => {
                assert_eq!(msg.kind, Kind::Text);
                assert_eq!(msg.content.as_deref(), Some("hi"));
            }
            other => panic!("expected message, got {other:?}"),
        }

        listener.stop().await;
        assert_eq!(listener.session().state(), SessionState::Ended);
        match next_event(&mut jrx).await {
            Event::Message(msg) => assert_eq!(msg.kind, Kind::Leave),
            other => panic!("expected leave, got {other:?}"),
        }
        assert!(matches!(next_event(&mut jrx).await, Event::Disconnected));
        assert_eq!(joiner.session().state(), SessionState::Ended);
        assert!(matches!(next_state_event(&mut lrx).await, Event::Disconnected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(jrx.try_recv().is_err());
        assert!(lrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn joiner_stop_disconnects_listener() {
        let (listener, mut lrx, joiner, mut jrx, _) = connected_pair("comet-1").await;
        joiner.stop().await;
        assert!(matches!(next_state_event(&mut lrx).await, Event::Disconnected));
        assert_eq!(listener.session().state(), SessionState::Ended);
        assert!(matches!(next_state_event(&mut jrx).await, Event::Disconnected));
        assert_eq!(joiner.session().state(), SessionState::Ended);
        let kinds: Vec<Kind> = joiner.session().messages().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![Kind::Leave]);
    }

    #[tokio::test]
    async fn session_mismatch_fails_join_and_listener_keeps_waiting() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (joiner, _jrx) = Endpoint::joiner(Arc::new(Session::new("comet-7")));
        let err = joiner.connect(&addr.to_string()).await.unwrap_err();
        match err {
            EndpointError::Handshake(HandshakeError::Rejected(reason)) => {
                assert!(reason.contains("mismatch"), "{reason}")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!joiner.is_attached().await);
        assert_eq!(listener.session().state(), SessionState::Waiting);

        // The slot is free again for a correct joiner.
        wait_until(|| {
            listener
                .shared
                .writer
                .try_lock()
                .map(|w| w.is_none())
                .unwrap_or(false)
        })
        .await;
        let (good, mut grx) = Endpoint::joiner(Arc::new(Session::new("nova-42")));
        good.connect(&addr.to_string()).await.unwrap();
        assert!(matches!(next_event(&mut grx).await, Event::Connected));
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
    }

    #[tokio::test]
    async fn second_connection_is_rejected_without_disturbing_first() {
        let (listener, mut lrx, joiner, _jrx, addr) = connected_pair("nova-42").await;

        let mut intruder = TcpStream::connect(addr).await.unwrap();
        let hello = encode_frame(&Message::handshake(Kind::Hello, "nova-42")).unwrap();
        let _ = intruder.write_all(&hello).await;
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(WAIT, intruder.read(&mut buf))
            .await
            .expect("intruder was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(listener.session().state(), SessionState::Active);
        joiner.send_message(Message::text("still here")).await.unwrap();
        match next_event(&mut lrx).await {
            Event::Message(msg) => assert_eq!(msg.content.as_deref(), Some("still here")),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong() {
        let (listener, mut lrx, joiner, mut jrx, _) = connected_pair("nova-42").await;
        joiner
            .send_message(Message::control(Kind::Ping))
            .await
            .unwrap();

        match next_event(&mut lrx).await {
            Event::Message(msg) => assert_eq!(msg.kind, Kind::Ping),
            other => panic!("expected ping, got {other:?}"),
        }
        match next_event(&mut jrx).await {
            Event::Message(msg) => assert_eq!(msg.kind, Kind::Pong),
            other => panic!("expected pong, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(jrx.try_recv().is_err());

        let kinds = |e: &Endpoint| {
            let mut k: Vec<Kind> = e.session().messages().iter().map(|m| m.kind).collect();
            k.sort_by_key(|k| k.as_str());
            k
        };
        wait_until(|| listener.session().message_count() == 2).await;
        assert_eq!(kinds(&listener), vec![Kind::Ping, Kind::Pong]);
        assert_eq!(kinds(&joiner), vec![Kind::Ping, Kind::Pong]);
    }

    #[tokio::test]
    async fn malformed_frame_ends_connection() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read_half);

        let hello = encode_frame(&Message::handshake(Kind::Hello, "nova-42")).unwrap();
        write_half.write_all(&hello).await.unwrap();
        let welcome = read_msg(&mut reader).await;
        assert_eq!(welcome.kind, Kind::Welcome);
        assert_eq!(welcome.session_id.as_deref(), Some("nova-42"));
        let ready = encode_frame(&Message::control(Kind::Ready)).unwrap();
        write_half.write_all(&ready).await.unwrap();
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));

        write_half
            .write_all(b"{\"type\":\"shout\",\"timestamp\":1}\n")
            .await
            .unwrap();
        assert!(matches!(next_event(&mut lrx).await, Event::Disconnected));
        assert_eq!(listener.session().state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn stalled_peer_times_out_and_frees_slot() {
        let (listener, rx) = Endpoint::listener(Arc::new(Session::new("nova-42")));
        let listener = listener.with_handshake_timeout(Some(Duration::from_millis(100)));
        let mut lrx = rx;
        let addr = listener.listen("127.0.0.1:0").await.unwrap();

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(WAIT, stalled.read(&mut buf))
            .await
            .expect("stalled peer was not dropped");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(listener.session().state(), SessionState::Waiting);

        let (joiner, _jrx) = Endpoint::joiner(Arc::new(Session::new("nova-42")));
        joiner.connect(&addr.to_string()).await.unwrap();
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
    }

    #[tokio::test]
    async fn joiner_rejects_unexpected_reply() {
        let fake = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = fake.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = fake.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let hello = read_msg(&mut reader).await;
            assert_eq!(hello.kind, Kind::Hello);
            let ping = encode_frame(&Message::control(Kind::Ping)).unwrap();
            write_half.write_all(&ping).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (joiner, mut jrx) = Endpoint::joiner(Arc::new(Session::new("nova-42")));
        let err = joiner.connect(&addr.to_string()).await.unwrap_err();
        assert!(matches!(
            err,
            EndpointError::Handshake(HandshakeError::UnexpectedMessage {
                expected: Kind::Welcome,
                got: Kind::Ping
            })
        ));
        assert_eq!(joiner.session().state(), SessionState::Created);
        assert!(jrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_over_in_memory_stream() {
        let (local, remote) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(remote);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let hello = decode_frame(line.as_bytes()).unwrap().0;
            let id = hello.session_id.unwrap();
            let welcome = encode_frame(&Message::handshake(Kind::Welcome, id)).unwrap();
            write_half.write_all(&welcome).await.unwrap();
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            let kind = decode_frame(line.as_bytes()).unwrap().0.kind;
            // Hand the halves back so the stream stays open.
            (kind, reader, write_half)
        });

        let (joiner, mut jrx) = Endpoint::joiner(Arc::new(Session::new("ghost-fox-9")));
        joiner.join_stream(local).await.unwrap();
        assert!(matches!(next_event(&mut jrx).await, Event::Connected));
        let (kind, _reader, _writer) = peer.await.unwrap();
        assert_eq!(kind, Kind::Ready);
        assert_eq!(joiner.session().state(), SessionState::Active);
    }

    #[tokio::test]
    async fn send_before_join_fails() {
        let (joiner, _rx) = Endpoint::joiner(Arc::new(Session::new("x")));
        assert!(matches!(
            joiner.send_message(Message::text("hello?")).await,
            Err(EndpointError::NotActive)
        ));
        assert!(joiner.session().messages().is_empty());
    }

    #[tokio::test]
    async fn listener_refuses_chat_until_handshake_completes() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut reader = BufReader::new(read_half);
        wait_until(|| slot_is_taken(&listener)).await;

        assert!(matches!(
            listener.send_message(Message::text("too early")).await,
            Err(EndpointError::NotActive)
        ));
        assert_eq!(listener.session().state(), SessionState::Waiting);
        assert!(listener.session().messages().is_empty());

        // The first frame on the wire is still the Welcome.
        let hello = encode_frame(&Message::handshake(Kind::Hello, "nova-42")).unwrap();
        write_half.write_all(&hello).await.unwrap();
        assert_eq!(read_msg(&mut reader).await.kind, Kind::Welcome);
        send_ready(&mut write_half).await;
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));

        listener.send_message(Message::text("now")).await.unwrap();
        let msg = read_msg(&mut reader).await;
        assert_eq!(msg.kind, Kind::Text);
        assert_eq!(msg.content.as_deref(), Some("now"));
        assert_eq!(listener.session().message_count(), 1);
    }

    #[tokio::test]
    async fn peer_closing_before_ready_leaves_listener_waiting() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (reader, writer) = raw_joiner(addr, "nova-42").await;
        drop(writer);
        drop(reader);

        wait_until(|| slot_is_free(&listener)).await;
        assert_eq!(listener.session().state(), SessionState::Waiting);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lrx.try_recv().is_err());

        let (joiner, mut jrx) = Endpoint::joiner(Arc::new(Session::new("nova-42")));
        joiner.connect(&addr.to_string()).await.unwrap();
        assert!(matches!(next_event(&mut jrx).await, Event::Connected));
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
    }

    #[tokio::test]
    async fn second_connection_during_handshake_is_rejected() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (mut reader, mut writer) = raw_joiner(addr, "nova-42").await;

        assert_turned_away(addr, "nova-42").await;
        assert_eq!(listener.session().state(), SessionState::Waiting);
        assert!(lrx.try_recv().is_err());

        send_ready(&mut writer).await;
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
        assert_eq!(listener.session().state(), SessionState::Active);
        listener
            .send_message(Message::text("welcome aboard"))
            .await
            .unwrap();
        let msg = read_msg(&mut reader).await;
        assert_eq!(msg.content.as_deref(), Some("welcome aboard"));
    }

    #[tokio::test]
    async fn no_peer_attaches_while_stop_is_closing_the_stream() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (_reader, mut writer) = raw_joiner(addr, "nova-42").await;
        send_ready(&mut writer).await;
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));
        fill_peer_window(&listener).await;

        // The Leave write now blocks on the full window while stop runs.
        let listener = Arc::new(listener);
        let stopping = tokio::spawn({
            let listener = listener.clone();
            async move { listener.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_turned_away(addr, "nova-42").await;

        tokio::time::timeout(WAIT, stopping)
            .await
            .expect("stop did not return")
            .unwrap();
        assert_eq!(listener.session().state(), SessionState::Ended);
        assert!(matches!(next_state_event(&mut lrx).await, Event::Disconnected));
    }

    #[tokio::test]
    async fn stop_returns_while_a_send_is_blocked() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        let (_reader, mut writer) = raw_joiner(addr, "nova-42").await;
        send_ready(&mut writer).await;
        assert!(matches!(next_event(&mut lrx).await, Event::Connected));

        let listener = Arc::new(listener);
        let sender = tokio::spawn({
            let listener = listener.clone();
            async move {
                let bulk = "x".repeat(256 * 1024);
                while listener
                    .send_message(Message::text(bulk.clone()))
                    .await
                    .is_ok()
                {}
            }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(WAIT, listener.stop())
            .await
            .expect("stop waited on the blocked send");
        tokio::time::timeout(WAIT, sender)
            .await
            .expect("blocked send was not abandoned")
            .unwrap();
        assert_eq!(listener.session().state(), SessionState::Ended);
        assert!(matches!(next_state_event(&mut lrx).await, Event::Disconnected));
        assert!(matches!(
            listener.send_message(Message::text("late")).await,
            Err(EndpointError::NotActive)
        ));
    }

    #[tokio::test]
    async fn frame_reader_handles_split_and_coalesced_frames() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(Box::new(local));
        let big = Message::text("y".repeat(3 * READ_CHUNK));
        let mut bytes = encode_frame(&big).unwrap();
        bytes.extend(encode_frame(&Message::control(Kind::Ping)).unwrap());
        bytes.extend(encode_frame(&Message::control(Kind::Pong)).unwrap());
        let feeder = tokio::spawn(async move {
            for piece in bytes.chunks(7) {
                remote.write_all(piece).await.unwrap();
            }
            remote
        });

        assert_eq!(reader.next_frame().await.unwrap(), Some(big));
        let ping = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(ping.kind, Kind::Ping);
        let pong = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(pong.kind, Kind::Pong);
        assert_eq!(reader.scanned, 0);

        drop(feeder.await.unwrap());
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_reader_rejects_unterminated_oversized_frame() {
        let (local, mut remote) = tokio::io::duplex(READ_CHUNK);
        let mut reader = FrameReader::new(Box::new(local));
        tokio::spawn(async move {
            let filler = vec![b'a'; READ_CHUNK];
            while remote.write_all(&filler).await.is_ok() {}
        });
        assert!(matches!(
            reader.next_frame().await,
            Err(EndpointError::Decode(FrameDecodeError::TooLarge))
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_listener() {
        let (listener, mut lrx, addr) = start_listener("nova-42").await;
        listener.stop().await;
        listener.stop().await;
        assert_eq!(listener.session().state(), SessionState::Ended);
        assert!(matches!(
            listener.listen("127.0.0.1:0").await,
            Err(EndpointError::Stopped)
        ));

        // Listener socket is gone once the accept loop observes shutdown.
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
        assert!(lrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn role_is_enforced() {
        let (listener, _rx) = Endpoint::listener(Arc::new(Session::new("x")));
        assert!(matches!(
            listener.connect("127.0.0.1:1").await,
            Err(EndpointError::WrongRole(Role::Listener))
        ));
        let (joiner, _rx) = Endpoint::joiner(Arc::new(Session::new("x")));
        assert!(matches!(
            joiner.listen("127.0.0.1:0").await,
            Err(EndpointError::WrongRole(Role::Joiner))
        ));
    }
}
