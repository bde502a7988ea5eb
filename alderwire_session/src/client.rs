// Client endpoint.
//
// Admission is driven from `open()`: the connection request goes out as a
// datagram and is re-sent at the configured rate until the server answers,
// up to the attempt limit. `Accepted` leads into the TCP handshake; the
// first stream packet is read blocking (there is nothing else to do before
// the identity grant) and must carry `LocalClientConnected`. After that,
// both sockets go nonblocking and the endpoint joins the normal
// receive/send rhythm.
//
// Host-role reconciliation: a `Host`-role client sets the host flag in its
// request. `HostAlreadyAssigned` downgrades it to a regular client and the
// next attempt retries without the flag; after admission, the client
// promotes itself exactly when the granted authority id equals its own.
//
// Every outbound packet header carries the assigned id and secret; the
// server silently drops mismatches.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use alderwire_protocol::control::{ControlMessage, PingRequest};
use alderwire_protocol::packet::{iter_messages, Packet, PacketAssembler, PacketHeader};
use alderwire_protocol::rpc::RpcHeader;
use alderwire_protocol::transform::TransformPipeline;
use alderwire_protocol::types::{ClientId, ConnectionResponseCode, StringId, Transport};

use crate::buffer::{
    base_header, drain_datagrams, drain_stream, flush_datagram, flush_stream, now_ms, version_ok,
    Batch, Buffer,
};
use crate::config::{Config, Role};
use crate::error::{Result, SessionError};
use crate::message::{OutboundMessage, SessionEvent};
use crate::ping::PingList;

pub(crate) struct ClientBuffer {
    config: Arc<Config>,
    app_id: StringId,
    session_id: StringId,
    udp: UdpSocket,
    stream: Option<TcpStream>,
    assembler: PacketAssembler,
    tcp_packet: Packet,
    udp_packet: Packet,
    pipeline: TransformPipeline,
    pings: PingList,
    local_id: ClientId,
    secret: u32,
    authority: ClientId,
    is_host: bool,
    request_as_host: bool,
    backlog: Vec<SessionEvent>,
    active: bool,
}

impl ClientBuffer {
    pub fn new(config: Arc<Config>, pipeline: TransformPipeline) -> Result<ClientBuffer> {
        let bind_addr: SocketAddr = match config.server_addr {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let udp = UdpSocket::bind(bind_addr)?;
        Ok(ClientBuffer {
            app_id: config.app_string_id()?,
            session_id: config.session_string_id()?,
            request_as_host: config.role == Role::Host,
            pipeline,
            tcp_packet: Packet::outbound(config.buffer_size),
            udp_packet: Packet::outbound(config.buffer_size),
            config,
            udp,
            stream: None,
            assembler: PacketAssembler::new(),
            pings: PingList::new(),
            local_id: ClientId::NONE,
            secret: 0,
            authority: ClientId::NONE,
            is_host: false,
            backlog: Vec::new(),
            active: false,
        })
    }

    /// Encode one admission request frame (header with zero id/secret, one
    /// connection-request message).
    fn request_frame(&self, as_host: bool) -> Result<Vec<u8>> {
        let mut packet = Packet::outbound(self.config.buffer_size);
        let request = ControlMessage::ConnectionRequest(alderwire_protocol::ConnectionRequest {
            app_id: self.app_id.clone(),
            session_id: self.session_id.clone(),
            as_host,
        });
        packet.push_message(&request.encode(ClientId::NONE, ClientId::NONE));
        let mut header = base_header(&self.config, ClientId::NONE, 0);
        let mut frame = packet.emit(&mut header).to_vec();
        self.pipeline.apply_send(&mut frame)?;
        Ok(frame)
    }

    /// Phase one: request admission over UDP until accepted, rejected, or
    /// out of attempts. Each attempt blocks on the response for at most the
    /// request rate.
    fn request_admission(&mut self) -> Result<()> {
        let server_udp = self.config.udp_addr();
        self.udp.set_nonblocking(false)?;
        self.udp
            .set_read_timeout(Some(self.config.request_rate()))?;

        let mut as_host = self.request_as_host;
        for attempt in 0..self.config.connection_request_limit {
            let frame = self.request_frame(as_host)?;
            self.udp.send_to(&frame, server_udp)?;
            debug!(attempt, as_host, "connection request sent");

            let deadline = Instant::now() + self.config.request_rate();
            loop {
                let mut buf = [0u8; 16];
                match self.udp.recv_from(&mut buf) {
                    Ok((4, src)) if src == server_udp => {
                        let code = ConnectionResponseCode::from_bytes([
                            buf[0], buf[1], buf[2], buf[3],
                        ])?;
                        match code {
                            ConnectionResponseCode::Accepted => return Ok(()),
                            ConnectionResponseCode::HostAlreadyAssigned => {
                                info!("host role taken, downgrading to regular client");
                                as_host = false;
                                self.request_as_host = false;
                                break;
                            }
                            rejection => return Err(SessionError::Rejected(rejection)),
                        }
                    }
                    Ok(_) => {
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        break;
                    }
                    Err(e) => return Err(SessionError::Io(e)),
                }
            }
        }
        Err(SessionError::AttemptsExhausted)
    }

    /// Phase two: the stream handshake. Blocks until the first packet — the
    /// identity grant — has been processed.
    fn complete_handshake(&mut self, batch: &mut Batch) -> Result<()> {
        let mut stream = TcpStream::connect(self.config.tcp_addr())?;
        let _ = stream.set_nodelay(true);

        // The very first packet is read without a timeout: nothing useful
        // can happen before the identity grant arrives. Trailing bytes of a
        // follow-up packet stay buffered in the assembler.
        let mut frames = Vec::new();
        while frames.is_empty() {
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(SessionError::NotConnected);
            }
            let mut offset = 0;
            while offset < n {
                offset += self.assembler.ingest(&buf[offset..n])?;
                if let Some(frame) = self.assembler.take_frame() {
                    frames.push(frame);
                }
            }
        }
        for frame in frames {
            self.process_frame(frame, batch);
        }
        if self.local_id.is_none() {
            return Err(SessionError::InvalidState(
                "first stream packet carried no identity grant",
            ));
        }

        stream.set_nonblocking(true)?;
        self.udp.set_read_timeout(None)?;
        self.udp.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.active = true;
        info!(id = self.local_id.0, host = self.is_host, "admitted to session");
        Ok(())
    }

    fn apply_assignment(
        &mut self,
        assignment: alderwire_protocol::ClientIdAssignment,
        batch: &mut Batch,
    ) {
        self.local_id = assignment.assigned_id;
        self.secret = assignment.client_secret;
        self.authority = assignment.authority_id;
        self.is_host =
            !assignment.assigned_id.is_none() && assignment.assigned_id == assignment.authority_id;
        if self.request_as_host && !self.is_host {
            info!("requested host role but another client holds it");
        }
        batch.control.push(SessionEvent::LocalConnected(assignment));
    }

    fn process_frame(&mut self, mut frame: Vec<u8>, batch: &mut Batch) {
        if let Err(e) = self.pipeline.apply_receive(&mut frame) {
            warn!(error = %e, "receive transform failed, packet dropped");
            return;
        }
        let header = match PacketHeader::parse(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed packet header");
                return;
            }
        };
        if !version_ok(&self.config, &header) {
            warn!("stream packet below version floor, disconnecting");
            self.local_disconnect(batch);
            return;
        }
        for message in iter_messages(&frame) {
            match message {
                Ok(bytes) => self.handle_message(bytes, batch),
                Err(e) => {
                    warn!(error = %e, "message framing error");
                    break;
                }
            }
        }
    }

    fn handle_message(&mut self, message: &[u8], batch: &mut Batch) {
        let mut input = message;
        let header = match RpcHeader::read(&mut input) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "unreadable rpc header");
                return;
            }
        };

        if !header.rpc_id.is_control() {
            batch.rpc.push(SessionEvent::Rpc {
                header,
                args: input.to_vec(),
            });
            return;
        }

        match ControlMessage::decode(&header, &mut input) {
            Ok(ControlMessage::ClientConnected(id)) => {
                batch.control.push(SessionEvent::ClientConnected(id));
            }
            Ok(ControlMessage::LocalClientConnected(assignment)) => {
                self.apply_assignment(assignment, batch);
            }
            Ok(ControlMessage::ClientDisconnected(id)) => {
                batch.control.push(SessionEvent::ClientDisconnected(id));
            }
            Ok(ControlMessage::HostMigration(new_authority)) => {
                self.authority = new_authority;
                let was_host = self.is_host;
                self.is_host = !self.local_id.is_none() && self.local_id == new_authority;
                if self.is_host && !was_host {
                    info!("promoted to host");
                } else if was_host && !self.is_host {
                    info!("demoted from host");
                }
                batch.control.push(SessionEvent::HostMigrated(new_authority));
            }
            Ok(ControlMessage::Spawn(notice)) => {
                batch.control.push(SessionEvent::Spawned {
                    notice,
                    owner: header.caller,
                });
            }
            Ok(ControlMessage::Despawn(id)) => {
                batch.control.push(SessionEvent::Despawned(id));
            }
            Ok(ControlMessage::Ping(request)) => self.handle_ping(request, batch),
            Ok(ControlMessage::ConnectionRequest(_)) => {
                debug!("stray connection request ignored");
            }
            Err(e) => warn!(error = %e, "undecodable control message"),
        }
    }

    fn handle_ping(&mut self, mut request: PingRequest, batch: &mut Batch) {
        let now = now_ms();
        if request.receive_time_ms == 0 {
            if request.target == self.local_id {
                request.receive_time_ms = now;
                let echo = ControlMessage::Ping(request).encode(self.local_id, request.source);
                self.tcp_packet.push_message(&echo);
            } else {
                debug!(target = request.target.0, "ping for someone else dropped");
            }
        } else if request.source == self.local_id {
            if let Some(resolved) = self.pings.resolve(&request, now) {
                batch.control.push(SessionEvent::PingResolved(resolved));
            }
        } else {
            debug!("stray ping echo dropped");
        }
    }

    fn local_disconnect(&mut self, batch: &mut Batch) {
        if !self.active && self.stream.is_none() {
            return;
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.active = false;
        batch.control.push(SessionEvent::LocalDisconnected);
        info!("disconnected from session");
    }
}

impl Buffer for ClientBuffer {
    fn open(&mut self) -> Result<Vec<SessionEvent>> {
        if self.active {
            return Err(SessionError::InvalidState("already connected"));
        }
        let mut batch = Batch::default();
        self.request_admission()?;
        self.complete_handshake(&mut batch)?;
        Ok(batch.into_events())
    }

    fn receive(&mut self) -> Result<Vec<SessionEvent>> {
        let mut batch = Batch::default();
        batch.control.append(&mut self.backlog);
        if !self.active {
            return Ok(batch.into_events());
        }

        // Stream transport.
        let mut frames = Vec::new();
        let mut closed = false;
        if let Some(stream) = self.stream.as_mut() {
            match drain_stream(stream, &mut self.assembler, &mut frames) {
                Ok(c) => closed = c,
                Err(e) => {
                    warn!(error = %e, "stream drain failed");
                    closed = true;
                }
            }
        }
        for frame in frames {
            self.process_frame(frame, &mut batch);
        }
        if closed {
            self.local_disconnect(&mut batch);
            return Ok(batch.into_events());
        }

        // Datagram transport.
        let server_udp = self.config.udp_addr();
        let mut datagrams = Vec::new();
        drain_datagrams(&self.udp, &mut datagrams)?;
        for (src, frame) in datagrams {
            if src != server_udp {
                debug!(from = %src, "datagram from unexpected source dropped");
                continue;
            }
            self.process_frame(frame, &mut batch);
        }

        for failed in self.pings.sweep() {
            batch.control.push(SessionEvent::PingResolved(failed));
        }

        Ok(batch.into_events())
    }

    fn send(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let mut header = base_header(&self.config, self.local_id, self.secret);
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = flush_stream(stream, &mut self.tcp_packet, &mut header, &self.pipeline)
            {
                warn!(error = %e, "stream flush failed");
                let mut batch = Batch::default();
                self.local_disconnect(&mut batch);
                self.backlog.append(&mut batch.control);
                return Ok(());
            }
        }
        flush_datagram(
            &self.udp,
            self.config.udp_addr(),
            &mut self.udp_packet,
            &mut header,
            &self.pipeline,
        )?;
        Ok(())
    }

    fn enqueue(&mut self, message: OutboundMessage) {
        // A client has a single link; routing happens at the server/relay.
        match message.transport {
            Transport::Stream => self.tcp_packet.push_message(&message.payload),
            Transport::Datagram => self.udp_packet.push_message(&message.payload),
        }
    }

    fn disconnect_all(&mut self) {
        let mut batch = Batch::default();
        self.local_disconnect(&mut batch);
        self.backlog.append(&mut batch.control);
    }

    fn disconnect_client(&mut self, _id: ClientId) -> Result<()> {
        Err(SessionError::InvalidState(
            "clients cannot disconnect other peers",
        ))
    }

    fn migrate_host(&mut self, new_host: ClientId) -> Result<()> {
        if !self.is_host {
            return Err(SessionError::InvalidState(
                "only the current host can migrate authority",
            ));
        }
        let message =
            ControlMessage::HostMigration(new_host).encode(self.local_id, ClientId::NONE);
        self.tcp_packet.push_message(&message);
        Ok(())
    }

    fn ping(&mut self, target: ClientId) -> PingRequest {
        let now = now_ms();
        if target == self.local_id {
            // Self-ping: resolve locally, no socket involved.
            let mut request = PingRequest::new(self.local_id, target, now);
            request.receive_time_ms = now;
            request.response_time_ms = now;
            request.resolved = true;
            self.backlog.push(SessionEvent::PingResolved(request));
            return request;
        }
        let request = self.pings.begin(self.local_id, target, now);
        let message = ControlMessage::Ping(request).encode(self.local_id, target);
        self.tcp_packet.push_message(&message);
        request
    }

    fn local_id(&self) -> ClientId {
        self.local_id
    }

    fn authority(&self) -> ClientId {
        self.authority
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
