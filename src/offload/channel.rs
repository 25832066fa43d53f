use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use tungstenite::{Message, WebSocket};
use url::Url;

use super::protocol::{self, FrameMeta, InboundMessage};
use crate::error::TransportError;
use crate::frame::BackgroundMode;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle. Exactly one socket is live at a time; a retry
/// state always holds exactly one pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    ClosedPendingRetry,
    ErrorPendingRetry,
}

/// Pure reconnect state machine, kept free of I/O so backoff behavior is
/// testable in isolation.
///
/// Transitions: `connecting -> open` on handshake; `open -> closed-pending-
/// retry` on remote close; any active state `-> error-pending-retry` on a
/// transport error; `*-pending-retry -> connecting` once the fixed delay
/// elapses. The delay never grows.
pub struct ConnectionSupervisor {
    state: ConnectionState,
    retry_at: Option<Instant>,
    delay: Duration,
}

impl ConnectionSupervisor {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            retry_at: None,
            delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_pending_retry(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ClosedPendingRetry | ConnectionState::ErrorPendingRetry
        )
    }

    pub fn on_open(&mut self) {
        self.state = ConnectionState::Open;
        self.retry_at = None;
    }

    pub fn on_remote_close(&mut self, now: Instant) {
        if self.retry_at.is_some() {
            return;
        }
        self.state = ConnectionState::ClosedPendingRetry;
        self.retry_at = Some(now + self.delay);
    }

    pub fn on_transport_error(&mut self, now: Instant) {
        if self.retry_at.is_some() {
            return;
        }
        self.state = ConnectionState::ErrorPendingRetry;
        self.retry_at = Some(now + self.delay);
    }

    /// Consume an elapsed retry timer and move back to connecting.
    pub fn poll_reconnect(&mut self, now: Instant) -> bool {
        match self.retry_at {
            Some(at) if now >= at => {
                self.retry_at = None;
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Manual reconnect request: forces connecting unless a retry timer
    /// is already pending (never two concurrent timers).
    pub fn request_reconnect(&mut self) -> bool {
        if self.retry_at.is_some() || self.state == ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    #[cfg(test)]
    fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }
}

/// Something the channel produced this tick.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Ack(BackgroundMode),
    Frame { meta: FrameMeta, image: Vec<u8> },
}

/// Persistent connection to the remote segmentation worker.
///
/// Ships downsampled frames out, receives processed frames and detection
/// metadata back, and reconnects forever with a fixed backoff until
/// disposed. All failures here are absorbed: the pipeline only ever sees
/// state changes and events.
pub struct OffloadChannel {
    url: String,
    health_url: String,
    supervisor: ConnectionSupervisor,
    socket: Option<WebSocket<TcpStream>>,
    connect_rx: Option<Receiver<Result<WebSocket<TcpStream>, TransportError>>>,
    mode: BackgroundMode,
    mode_dirty: bool,
    control_sent: bool,
    outstanding_sends: u32,
    max_outstanding: u32,
    send_width: u32,
    jpeg_quality: u8,
    disposed: bool,
}

impl OffloadChannel {
    pub fn new(
        url: String,
        health_url: String,
        reconnect_delay: Duration,
        max_outstanding: u32,
        send_width: u32,
        jpeg_quality: u8,
        initial_mode: BackgroundMode,
    ) -> Self {
        Self {
            url,
            health_url,
            supervisor: ConnectionSupervisor::new(reconnect_delay),
            socket: None,
            connect_rx: None,
            mode: initial_mode,
            mode_dirty: false,
            control_sent: false,
            outstanding_sends: 0,
            max_outstanding,
            send_width,
            jpeg_quality,
            disposed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn is_open(&self) -> bool {
        self.supervisor.state() == ConnectionState::Open && self.socket.is_some()
    }

    pub fn is_pending_retry(&self) -> bool {
        self.supervisor.is_pending_retry()
    }

    pub fn mode_dirty(&self) -> bool {
        self.mode_dirty
    }

    /// Record a mode change. Sends an immediate control message when the
    /// channel is open and marks the mode dirty until the worker acks it.
    /// Re-requesting the current mode sends nothing.
    pub fn set_mode(&mut self, mode: BackgroundMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        self.mode_dirty = true;
        self.control_sent = if self.is_open() {
            self.send_text(protocol::encode_mode_change(mode))
        } else {
            false
        };
    }

    /// Ship one frame, downsampled and JPEG-encoded. Skipped while the
    /// channel is not open or too many sends are already outstanding.
    pub fn send_frame(&mut self, frame: &image::RgbImage) {
        if !self.is_open() {
            return;
        }
        if self.outstanding_sends >= self.max_outstanding {
            tracing::debug!(
                "skipping frame send: {} sends outstanding",
                self.outstanding_sends
            );
            return;
        }

        match protocol::encode_frame_payload(frame, self.send_width, self.jpeg_quality) {
            Ok(payload) => {
                let message = protocol::encode_frame_data(&payload, self.mode);
                if self.send_text(message) {
                    self.outstanding_sends += 1;
                }
            }
            Err(err) => tracing::warn!("failed to encode outbound frame: {err:#}"),
        }
    }

    /// Advance the connection: start a connect attempt when due, collect
    /// its outcome, drain inbound messages, surface events. Handshakes and
    /// health probes run on a worker thread; this never blocks the caller.
    pub fn tick(&mut self, now: Instant) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        if self.disposed {
            return events;
        }

        self.supervisor.poll_reconnect(now);

        if self.supervisor.state() == ConnectionState::Connecting
            && self.socket.is_none()
            && self.connect_rx.is_none()
        {
            self.spawn_connect();
        }

        if let Some(rx) = &self.connect_rx {
            match rx.try_recv() {
                Ok(Ok(socket)) => {
                    self.connect_rx = None;
                    self.socket = Some(socket);
                    self.supervisor.on_open();
                    self.outstanding_sends = 0;
                    tracing::info!("offload channel open: {}", self.url);
                    // Announce the current mode straight away.
                    self.mode_dirty = true;
                    let control = protocol::encode_mode_change(self.mode);
                    self.control_sent = self.send_text(control);
                    events.push(ChannelEvent::Opened);
                }
                Ok(Err(_)) => {
                    // The worker already classified and logged the failure.
                    self.connect_rx = None;
                    self.supervisor.on_transport_error(now);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.connect_rx = None;
                    self.supervisor.on_transport_error(now);
                }
            }
        }

        // A mode change whose control message never reached the wire is
        // retried here until it goes out.
        if self.mode_dirty && !self.control_sent && self.is_open() {
            self.control_sent = self.send_text(protocol::encode_mode_change(self.mode));
        }

        self.drain_inbound(now, &mut events);
        events
    }

    /// Hand the handshake to a worker thread and keep the receiver for a
    /// later tick to collect.
    fn spawn_connect(&mut self) {
        let (tx, rx) = bounded(1);
        let url = self.url.clone();
        let health_url = self.health_url.clone();
        thread::spawn(move || {
            let outcome = connect(&url);
            if let Err(err) = &outcome {
                classify_and_log(&health_url, &err.to_string());
            }
            let _ = tx.send(outcome);
        });
        self.connect_rx = Some(rx);
    }

    fn drain_inbound(&mut self, now: Instant, events: &mut Vec<ChannelEvent>) {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            match socket.read() {
                Ok(Message::Text(text)) => match protocol::decode_text(&text) {
                    Ok(Some(InboundMessage::Ack { mode })) => {
                        if mode == self.mode {
                            self.mode_dirty = false;
                        }
                        events.push(ChannelEvent::Ack(mode));
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("dropping malformed text message: {err}"),
                },
                Ok(Message::Binary(buf)) => match protocol::decode_binary(&buf) {
                    Ok(InboundMessage::Frame { meta, image }) => {
                        self.outstanding_sends = self.outstanding_sends.saturating_sub(1);
                        events.push(ChannelEvent::Frame { meta, image });
                    }
                    Ok(other) => {
                        tracing::warn!("unexpected binary payload: {other:?}");
                    }
                    Err(err) => tracing::warn!("dropping malformed binary frame: {err}"),
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("offload server closed the connection");
                    self.teardown_socket();
                    self.supervisor.on_remote_close(now);
                    return;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(err) => {
                    let err = TransportError::Receive(err.to_string());
                    self.classify_in_background(&err);
                    self.teardown_socket();
                    self.supervisor.on_transport_error(now);
                    return;
                }
            }
        }
    }

    fn send_text(&mut self, text: String) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        match socket.send(Message::Text(text)) {
            Ok(()) => true,
            Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                // Socket buffer full: drop this message, keep the socket.
                tracing::debug!("send would block, dropping message");
                false
            }
            Err(err) => {
                let err = TransportError::Send(err.to_string());
                self.classify_in_background(&err);
                self.teardown_socket();
                self.supervisor.on_transport_error(Instant::now());
                false
            }
        }
    }

    /// Classify a transport error hit on the render thread. The probe is
    /// fired off to its own thread; only the log line depends on it.
    fn classify_in_background(&self, err: &TransportError) {
        let health_url = self.health_url.clone();
        let err = err.to_string();
        thread::spawn(move || classify_and_log(&health_url, &err));
    }

    /// Manual reconnect request from the hosting layer. Refused while a
    /// retry timer is already pending so there are never two timers.
    pub fn request_reconnect(&mut self) {
        if self.disposed {
            return;
        }
        if self.supervisor.request_reconnect() {
            self.teardown_socket();
            tracing::info!("manual reconnect requested");
        }
    }

    /// Drop the socket before closing it so nothing can fire on it after
    /// teardown. Safe to call any number of times.
    fn teardown_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
        }
    }

    /// Tear the channel down for good. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.connect_rx = None;
        self.teardown_socket();
        tracing::info!("offload channel disposed");
    }
}

impl Drop for OffloadChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Resolve, dial and handshake. Runs on a connect worker; the returned
/// socket's stream is non-blocking so later reads never stall a tick.
fn connect(url: &str) -> Result<WebSocket<TcpStream>, TransportError> {
    let parsed =
        Url::parse(url).map_err(|e| TransportError::BadEndpoint(format!("{url}: {e}")))?;
    if parsed.scheme() != "ws" {
        return Err(TransportError::BadEndpoint(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::BadEndpoint("missing host".to_string()))?;
    let port = parsed.port().unwrap_or(80);

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::BadEndpoint(e.to_string()))?
        .next()
        .ok_or_else(|| TransportError::BadEndpoint("host resolved to nothing".to_string()))?;

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    // Bound the handshake: a server that accepts and goes silent must not
    // pin the worker forever.
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let (socket, _response) =
        tungstenite::client(url, stream).map_err(|e| TransportError::Handshake(e.to_string()))?;

    // Handshake is done; inbound reads must not stall the pipeline.
    socket
        .get_ref()
        .set_nonblocking(true)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    Ok(socket)
}

/// Probe the health endpoint to tell "server unreachable" apart from a
/// socket-layer problem. Classification only affects the log line. Blocks
/// for up to the probe timeout, so this only ever runs on worker threads.
fn classify_and_log(health_url: &str, err: &str) {
    let reachable = ureq::get(health_url)
        .timeout(HEALTH_PROBE_TIMEOUT)
        .call()
        .is_ok();
    if reachable {
        tracing::warn!("offload transport error (server reachable, socket-layer): {err}");
    } else {
        tracing::warn!("offload transport error (server unreachable): {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(2);

    #[test]
    fn handshake_moves_connecting_to_open() {
        let mut sup = ConnectionSupervisor::new(DELAY);
        assert_eq!(sup.state(), ConnectionState::Connecting);
        sup.on_open();
        assert_eq!(sup.state(), ConnectionState::Open);
        assert!(!sup.is_pending_retry());
    }

    #[test]
    fn reconnect_delay_is_constant_across_consecutive_failures() {
        let mut sup = ConnectionSupervisor::new(DELAY);
        let mut now = Instant::now();

        for _ in 0..6 {
            sup.on_open();
            sup.on_transport_error(now);
            let deadline = sup.retry_deadline().expect("timer pending");
            assert_eq!(deadline - now, DELAY, "backoff must never grow");

            now = deadline;
            assert!(sup.poll_reconnect(now));
            assert_eq!(sup.state(), ConnectionState::Connecting);
        }
    }

    #[test]
    fn remote_close_and_error_land_in_distinct_retry_states() {
        let now = Instant::now();

        let mut sup = ConnectionSupervisor::new(DELAY);
        sup.on_open();
        sup.on_remote_close(now);
        assert_eq!(sup.state(), ConnectionState::ClosedPendingRetry);

        let mut sup = ConnectionSupervisor::new(DELAY);
        sup.on_open();
        sup.on_transport_error(now);
        assert_eq!(sup.state(), ConnectionState::ErrorPendingRetry);
    }

    #[test]
    fn a_second_failure_never_arms_a_second_timer() {
        let mut sup = ConnectionSupervisor::new(DELAY);
        let now = Instant::now();
        sup.on_open();
        sup.on_transport_error(now);
        let first = sup.retry_deadline().unwrap();

        sup.on_remote_close(now + Duration::from_millis(500));
        assert_eq!(sup.retry_deadline(), Some(first));
        assert_eq!(sup.state(), ConnectionState::ErrorPendingRetry);
    }

    #[test]
    fn timer_does_not_fire_early() {
        let mut sup = ConnectionSupervisor::new(DELAY);
        let now = Instant::now();
        sup.on_open();
        sup.on_remote_close(now);
        assert!(!sup.poll_reconnect(now + DELAY - Duration::from_millis(1)));
        assert!(sup.poll_reconnect(now + DELAY));
    }

    #[test]
    fn manual_reconnect_is_refused_while_a_timer_is_pending() {
        let mut sup = ConnectionSupervisor::new(DELAY);
        let now = Instant::now();
        sup.on_open();
        sup.on_transport_error(now);
        assert!(!sup.request_reconnect());

        // Once the timer has been consumed a manual request is redundant
        // but harmless.
        sup.poll_reconnect(now + DELAY);
        assert!(!sup.request_reconnect());

        sup.on_open();
        assert!(sup.request_reconnect());
        assert_eq!(sup.state(), ConnectionState::Connecting);
    }

    fn test_channel() -> OffloadChannel {
        OffloadChannel::new(
            "ws://localhost:1/ws".to_string(),
            "http://localhost:1/health".to_string(),
            DELAY,
            3,
            640,
            85,
            BackgroundMode::None,
        )
    }

    #[test]
    fn re_requesting_the_current_mode_sends_nothing() {
        let mut channel = test_channel();
        channel.set_mode(BackgroundMode::None);
        assert!(!channel.mode_dirty());

        channel.set_mode(BackgroundMode::Blur);
        assert!(channel.mode_dirty());

        // Same mode again: still exactly one pending change.
        channel.set_mode(BackgroundMode::Blur);
        assert!(channel.mode_dirty());
    }

    #[test]
    fn disposed_channel_stays_down() {
        let mut channel = test_channel();
        channel.dispose();
        channel.dispose();
        assert!(channel.tick(Instant::now()).is_empty());
        assert!(!channel.is_open());
    }

    /// Serve one WebSocket connection on a random local port and run
    /// `script` against it.
    fn spawn_server<F>(script: F) -> String
    where
        F: FnOnce(&mut WebSocket<TcpStream>) + Send + 'static,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                if let Ok(mut socket) = tungstenite::accept(stream) {
                    script(&mut socket);
                }
            }
        });
        format!("ws://{addr}/ws")
    }

    fn channel_for(url: String) -> OffloadChannel {
        OffloadChannel::new(
            url,
            "http://localhost:1/health".to_string(),
            DELAY,
            3,
            640,
            85,
            BackgroundMode::None,
        )
    }

    fn tick_until<F>(channel: &mut OffloadChannel, mut done: F) -> Vec<ChannelEvent>
    where
        F: FnMut(&[ChannelEvent]) -> bool,
    {
        let mut events = Vec::new();
        for _ in 0..400 {
            events.extend(channel.tick(Instant::now()));
            if done(&events) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn connect_attempt_does_not_stall_the_tick() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            // Accept the TCP connection but never answer the handshake.
            let conn = listener.accept();
            thread::sleep(Duration::from_millis(300));
            drop(conn);
        });

        let mut channel = channel_for(format!("ws://{addr}/ws"));
        let start = Instant::now();
        channel.tick(start);
        assert!(
            start.elapsed() < Duration::from_millis(200),
            "handshake must run on a worker, not inside tick"
        );
        assert!(!channel.is_open());
        server.join().unwrap();
    }

    #[test]
    fn truncated_binary_frame_yields_no_event() {
        let url = spawn_server(|socket| {
            // The client announces its mode first.
            let _ = socket.read();

            let meta = br#"{"isPersonDetected":true,"percentage":0.5,"mode":"blur"}"#;
            let mut valid = Vec::new();
            valid.extend_from_slice(&(meta.len() as u32).to_be_bytes());
            valid.extend_from_slice(meta);
            valid.extend_from_slice(&[0xff, 0xd8, 1, 2]);
            let mut truncated = valid.clone();
            truncated.truncate(10);

            socket.send(Message::Binary(truncated)).unwrap();
            socket.send(Message::Binary(valid)).unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let mut channel = channel_for(url);
        let events = tick_until(&mut channel, |events| {
            events
                .iter()
                .any(|e| matches!(e, ChannelEvent::Frame { .. }))
        });

        let frames: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Frame { meta, .. } => Some(meta),
                _ => None,
            })
            .collect();
        // The truncated message was sent first; only the well-formed one
        // may surface as an event.
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_person_detected);
        assert_eq!(frames[0].mode, BackgroundMode::Blur);
    }

    #[test]
    fn unsent_mode_change_is_retried_from_tick() {
        let (text_tx, text_rx) = crossbeam_channel::unbounded::<String>();
        let url = spawn_server(move |socket| {
            for _ in 0..3 {
                match socket.read() {
                    Ok(Message::Text(text)) => {
                        let _ = text_tx.send(text);
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            thread::sleep(Duration::from_millis(200));
        });

        let mut channel = channel_for(url);
        tick_until(&mut channel, |events| {
            events.iter().any(|e| matches!(e, ChannelEvent::Opened))
        });
        assert!(channel.is_open());

        channel.set_mode(BackgroundMode::Office);
        // A control message that never made it onto the wire leaves the
        // change pending; the next tick must retry it.
        channel.control_sent = false;
        channel.tick(Instant::now());

        let mut texts = Vec::new();
        for _ in 0..200 {
            while let Ok(text) = text_rx.try_recv() {
                texts.push(text);
            }
            if texts.len() >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let office_count = texts.iter().filter(|t| t.contains("office")).count();
        assert!(
            office_count >= 2,
            "pending mode change must be resent, saw {texts:?}"
        );
    }
}
