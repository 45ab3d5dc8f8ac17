//! CoAP transport seam
//!
//! Everything that touches the network goes through [`CoapTransport`]. The default
//! [`UdpTransport`] speaks RFC 7252 over a plain UDP socket using `coap-lite` packets;
//! tests and hosts can plug in their own implementation.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use coap_lite::option_value::OptionValueU16;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use tracing::{debug, warn};

use crate::coap_types::{CoapRequest, CoapResponse, ContentFormat, Method, ResponseCode};
use crate::error::{AdapterError, Result};

/// Largest datagram accepted from the server
const MAX_DATAGRAM: usize = 1500;

/// How often an observation thread checks for cancellation
const OBSERVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback receiving observe notifications; `None` means the transport lost the response
pub type NotificationHandler = Box<dyn Fn(Option<CoapResponse>) + Send + Sync + 'static>;

/// Network access used by discovery, synchronization and action dispatch
pub trait CoapTransport: Send + Sync {
    /// Send a request and wait for its response.
    ///
    /// `Ok(None)` means no response arrived (timeout or reset); `Err` is a
    /// connector failure.
    fn send(&self, request: &CoapRequest) -> Result<Option<CoapResponse>>;

    /// Register an observation. Notifications are delivered on a transport-owned thread.
    fn observe(&self, request: &CoapRequest, handler: NotificationHandler) -> Result<ObserveRelation>;
}

/// Handle for an active observe relation
///
/// Cancelling is idempotent and does not wait for in-flight notifications.
/// Dropping the handle cancels the relation.
pub struct ObserveRelation {
    cancelled: Arc<AtomicBool>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ObserveRelation {
    /// Create a relation that runs `on_cancel` once when cancelled
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Stop the relation; later notifications must be ignored
    pub fn proactive_cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }

    /// Check whether the relation was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for ObserveRelation {
    fn drop(&mut self) {
        self.proactive_cancel();
    }
}

impl fmt::Debug for ObserveRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveRelation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Default transport: confirmable CoAP over UDP
#[derive(Debug)]
pub struct UdpTransport {
    server: SocketAddr,
    ack_timeout: Duration,
    max_retransmit: u32,
    next_message_id: AtomicU16,
    next_token: AtomicU32,
}

impl UdpTransport {
    /// Create a transport for a resolved server address
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
            next_message_id: AtomicU16::new(1),
            next_token: AtomicU32::new(1),
        }
    }

    /// Resolve `host:port` and create a transport for it
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let server = (host, port)
            .to_socket_addrs()
            .map_err(transport_error)?
            .next()
            .ok_or_else(|| AdapterError::Transport(format!("cannot resolve {}:{}", host, port)))?;
        Ok(Self::new(server))
    }

    /// Override the RFC 7252 retransmission parameters
    pub fn with_retransmission(mut self, ack_timeout: Duration, max_retransmit: u32) -> Self {
        self.ack_timeout = ack_timeout;
        self.max_retransmit = max_retransmit;
        self
    }

    /// The server this transport talks to
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let local: SocketAddr = if self.server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(self.server)?;
        Ok(socket)
    }

    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_token(&self) -> Vec<u8> {
        self.next_token
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec()
    }
}

impl CoapTransport for UdpTransport {
    fn send(&self, request: &CoapRequest) -> Result<Option<CoapResponse>> {
        let socket = self.open_socket().map_err(transport_error)?;
        let message_id = self.next_message_id();
        let token = self.next_token();
        let bytes = encode(&build_packet(request, message_id, &token))?;

        let attempts = if request.confirmable {
            self.max_retransmit + 1
        } else {
            1
        };
        let mut timeout = self.ack_timeout;
        let mut acknowledged = false;

        for attempt in 0..attempts {
            if !acknowledged {
                if attempt > 0 {
                    debug!(path = %request.path, attempt, "retransmitting CoAP request");
                }
                socket.send(&bytes).map_err(transport_error)?;
            }

            let deadline = Instant::now() + timeout;
            while let Some(packet) = recv_until(&socket, deadline)? {
                let is_ours = packet.header.message_id == message_id;
                match packet.header.get_type() {
                    MessageType::Reset if is_ours => {
                        debug!(path = %request.path, "CoAP request reset by server");
                        return Ok(None);
                    }
                    MessageType::Acknowledgement
                        if is_ours && matches!(packet.header.code, MessageClass::Empty) =>
                    {
                        // Separate response follows
                        acknowledged = true;
                        continue;
                    }
                    _ => {}
                }

                if packet.get_token() != token.as_slice() {
                    continue;
                }
                if packet.header.get_type() == MessageType::Confirmable {
                    let _ = socket.send(&encode(&empty_ack(&packet))?);
                }
                if let Some(response) = response_from_packet(&packet) {
                    return Ok(Some(response));
                }
            }
            timeout *= 2;
        }

        Ok(None)
    }

    fn observe(&self, request: &CoapRequest, handler: NotificationHandler) -> Result<ObserveRelation> {
        let socket = self.open_socket().map_err(transport_error)?;
        socket
            .set_read_timeout(Some(OBSERVE_POLL_INTERVAL))
            .map_err(transport_error)?;

        let mut registration = request.clone();
        registration.observe = Some(0);
        let token = self.next_token();
        let bytes = encode(&build_packet(&registration, self.next_message_id(), &token))?;
        socket.send(&bytes).map_err(transport_error)?;

        let mut deregistration = registration.clone();
        deregistration.observe = Some(1);
        let deregister = encode(&build_packet(&deregistration, self.next_message_id(), &token))?;

        let session = ObserveSession {
            socket,
            token,
            path: request.path.clone(),
            registration: bytes,
            deregister,
            retransmit_timeout: self.ack_timeout,
            max_retransmit: self.max_retransmit,
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        thread::Builder::new()
            .name(format!("coap-observe{}", request.path))
            .spawn(move || session.run(&flag, handler))
            .map_err(transport_error)?;

        Ok(ObserveRelation::new(move || {
            cancelled.store(true, Ordering::SeqCst)
        }))
    }
}

/// State owned by one observation thread
struct ObserveSession {
    socket: UdpSocket,
    token: Vec<u8>,
    path: String,
    registration: Vec<u8>,
    deregister: Vec<u8>,
    retransmit_timeout: Duration,
    max_retransmit: u32,
}

impl ObserveSession {
    fn run(self, cancelled: &AtomicBool, handler: NotificationHandler) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut registered = false;
        let mut retransmits = 0;
        let mut timeout = self.retransmit_timeout;
        let mut next_retransmit = Instant::now() + timeout;

        while !cancelled.load(Ordering::SeqCst) {
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) if is_timeout(&e) => {
                    if !registered
                        && retransmits < self.max_retransmit
                        && Instant::now() >= next_retransmit
                    {
                        retransmits += 1;
                        timeout *= 2;
                        next_retransmit = Instant::now() + timeout;
                        debug!(path = %self.path, retransmits, "retransmitting observe registration");
                        let _ = self.socket.send(&self.registration);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(path = %self.path, "CoAP observation error: {}", e);
                    thread::sleep(OBSERVE_POLL_INTERVAL);
                    continue;
                }
            };

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(path = %self.path, "dropping malformed datagram: {:?}", e);
                    continue;
                }
            };
            if packet.get_token() != self.token.as_slice() {
                continue;
            }
            if packet.header.get_type() == MessageType::Confirmable {
                if let Ok(ack) = encode(&empty_ack(&packet)) {
                    let _ = self.socket.send(&ack);
                }
            }
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            if let Some(response) = response_from_packet(&packet) {
                registered = true;
                handler(Some(response));
            }
        }

        debug!(path = %self.path, "cancelling observation");
        let _ = self.socket.send(&self.deregister);
    }
}

/// Build a `coap-lite` packet from a transport-agnostic request
pub(crate) fn build_packet(request: &CoapRequest, message_id: u16, token: &[u8]) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.code = MessageClass::Request(match request.method {
        Method::Get => RequestType::Get,
        Method::Post => RequestType::Post,
        Method::Put => RequestType::Put,
    });
    packet.header.set_type(if request.confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    packet.set_token(token.to_vec());

    if let Some(observe) = request.observe {
        packet.set_observe_value(observe);
    }
    for segment in request.path_segments() {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    // raw ids so formats unknown to coap-lite still go out
    if let Some(format) = request.content_format {
        packet.add_option_as(CoapOption::ContentFormat, OptionValueU16(format.as_u16()));
    }
    if let Some(accept) = request.accept {
        packet.add_option_as(CoapOption::Accept, OptionValueU16(accept.as_u16()));
    }

    packet.payload = request.payload.clone();
    packet
}

/// Extract a response from a packet; `None` for empty messages and requests
pub(crate) fn response_from_packet(packet: &Packet) -> Option<CoapResponse> {
    match packet.header.code {
        MessageClass::Response(_) => {
            let content_format = packet
                .get_first_option_as::<OptionValueU16>(CoapOption::ContentFormat)
                .and_then(|value| value.ok())
                .map(|value| ContentFormat::from_u16(value.0));
            Some(CoapResponse {
                code: ResponseCode::from_raw(u8::from(packet.header.code)),
                payload: packet.payload.clone(),
                content_format,
            })
        }
        _ => None,
    }
}

fn empty_ack(packet: &Packet) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.message_id = packet.header.message_id;
    ack.header.code = MessageClass::Empty;
    ack
}

fn encode(packet: &Packet) -> Result<Vec<u8>> {
    packet
        .to_bytes()
        .map_err(|e| AdapterError::Transport(format!("cannot encode CoAP packet: {:?}", e)))
}

fn recv_until(socket: &UdpSocket, deadline: Instant) -> Result<Option<Packet>> {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(transport_error)?;
        match socket.recv(&mut buf) {
            Ok(len) => match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => debug!("dropping malformed datagram: {:?}", e),
            },
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(transport_error(e)),
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn transport_error(error: io::Error) -> AdapterError {
    AdapterError::Transport(error.to_string())
}
