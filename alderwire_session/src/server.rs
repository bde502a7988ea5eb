// Authoritative server endpoint.
//
// The server owns admission and the client table. Admission is two-phase:
// a UDP datagram carrying the connection request (answered with a 4-byte
// response code), then the TCP handshake, matched against the pending list
// by remote IP. An admitted client gets its identity over the stream —
// `LocalClientConnected` first, then one `ClientConnected` per existing
// peer — while existing peers learn about the newcomer.
//
// As the session authority, the server executes `ClientsToAuthority` RPCs
// locally and otherwise acts as the message hub: `ClientsToClients` traffic
// is rebroadcast without local execution, `ClientsToAll`/`AnyToAll` with a
// concrete callee routes point-to-point, everything else executes locally
// and fans out. Control ids are never relayed.
//
// All sockets are nonblocking; one receive pass sweeps expired admissions,
// drains UDP, accepts handshakes, drains every client stream, and expires
// pings.

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;

use tracing::{debug, info, warn};

use alderwire_protocol::control::{ClientIdAssignment, ConnectionRequest, ControlMessage, PingRequest};
use alderwire_protocol::packet::{iter_messages, PacketHeader};
use alderwire_protocol::rpc::RpcHeader;
use alderwire_protocol::transform::TransformPipeline;
use alderwire_protocol::types::{
    ClientId, ConnectionResponseCode, RpcPermission, StringId, Transport,
};

use crate::buffer::{
    base_header, drain_datagrams, drain_stream, flush_datagram, flush_stream, now_ms, version_ok,
    Batch, Buffer,
};
use crate::clients::ClientTable;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::message::{OutboundMessage, Recipients, SessionEvent};
use crate::pending::PendingList;
use crate::ping::PingList;
use crate::registry::RpcTable;

pub(crate) struct ServerBuffer {
    config: Arc<Config>,
    app_id: StringId,
    session_id: StringId,
    listener: TcpListener,
    udp: UdpSocket,
    clients: ClientTable,
    pending: PendingList,
    pipeline: TransformPipeline,
    rpc_table: Arc<RpcTable>,
    pings: PingList,
    /// Events produced outside a receive pass (send failures, teardown),
    /// delivered at the start of the next one.
    backlog: Vec<SessionEvent>,
    active: bool,
}

impl ServerBuffer {
    pub fn new(
        config: Arc<Config>,
        rpc_table: Arc<RpcTable>,
        pipeline: TransformPipeline,
    ) -> Result<ServerBuffer> {
        let listener = TcpListener::bind(config.tcp_addr())?;
        listener.set_nonblocking(true)?;
        let udp = UdpSocket::bind(config.udp_addr())?;
        udp.set_nonblocking(true)?;
        info!(tcp = %listener.local_addr()?, udp = %udp.local_addr()?, "server listening");
        Ok(ServerBuffer {
            app_id: config.app_string_id()?,
            session_id: config.session_string_id()?,
            pending: PendingList::new(config.request_timeout()),
            pipeline,
            config,
            listener,
            udp,
            clients: ClientTable::new(),
            rpc_table,
            pings: PingList::new(),
            backlog: Vec::new(),
            active: true,
        })
    }

    /// Validate an admission request and answer with a response code.
    fn handle_admission(&mut self, src: SocketAddr, request: &ConnectionRequest) {
        let code = self.admission_code(src, request);
        debug!(from = %src, ?code, "admission request");
        if let Err(e) = self.udp.send_to(&code.to_bytes(), src) {
            warn!(to = %src, error = %e, "admission response failed");
            return;
        }
        if code == ConnectionResponseCode::Accepted {
            self.pending.insert(src, request.as_host);
        }
    }

    fn admission_code(&self, src: SocketAddr, request: &ConnectionRequest) -> ConnectionResponseCode {
        if request.app_id != self.app_id {
            return ConnectionResponseCode::IncorrectAppId;
        }
        if request.session_id != self.session_id {
            return ConnectionResponseCode::Rejected;
        }
        if self.clients.len() + self.pending.len() >= self.config.max_clients as usize {
            return ConnectionResponseCode::ServerFull;
        }
        // The server itself holds the authority role.
        if request.as_host {
            return ConnectionResponseCode::HostAlreadyAssigned;
        }
        if let Some(whitelist) = &self.config.whitelist {
            if !whitelist.contains(&src.ip()) {
                return ConnectionResponseCode::Rejected;
            }
        }
        ConnectionResponseCode::Accepted
    }

    /// Phase two: match the TCP handshake against the pending list and
    /// build the client record.
    fn complete_admission(&mut self, stream: TcpStream, peer: SocketAddr, batch: &mut Batch) {
        let Some(pending) = self.pending.take_by_ip(peer.ip()) else {
            debug!(from = %peer, "handshake without pending admission, closing");
            return;
        };
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let _ = stream.set_nodelay(true);

        let id = self
            .clients
            .admit(stream, pending.udp_addr, self.config.buffer_size, pending.as_host);
        let secret = self.clients.get(id).map(|r| r.secret).unwrap_or(0);
        let assignment = ClientIdAssignment {
            assigned_id: id,
            authority_id: ClientId::NONE,
            client_secret: secret,
            max_clients: self.config.max_clients,
        };

        // Existing peers learn about the newcomer; the newcomer gets its
        // identity first, then the current roster.
        let newcomer_notice =
            ControlMessage::ClientConnected(id).encode(ClientId::NONE, ClientId::NONE);
        let mut roster = Vec::new();
        for other in self.clients.ids() {
            if other == id {
                continue;
            }
            roster.push(ControlMessage::ClientConnected(other).encode(ClientId::NONE, id));
            if let Some(record) = self.clients.get_mut(other) {
                record.tcp_packet.push_message(&newcomer_notice);
            }
        }
        if let Some(record) = self.clients.get_mut(id) {
            record.tcp_packet.push_message(
                &ControlMessage::LocalClientConnected(assignment).encode(ClientId::NONE, id),
            );
            for message in &roster {
                record.tcp_packet.push_message(message);
            }
        }

        info!(client = id.0, from = %peer, "client admitted");
        batch.control.push(SessionEvent::ClientConnected(id));
    }

    /// Remove a client, tell the survivors, queue the event.
    fn drop_client(&mut self, id: ClientId, events: &mut Vec<SessionEvent>) {
        let Some(record) = self.clients.remove(id) else {
            return;
        };
        let _ = record.stream.shutdown(std::net::Shutdown::Both);
        info!(client = id.0, "client disconnected");
        let notice = ControlMessage::ClientDisconnected(id).encode(ClientId::NONE, ClientId::NONE);
        for remaining in self.clients.iter_mut() {
            remaining.tcp_packet.push_message(&notice);
        }
        events.push(SessionEvent::ClientDisconnected(id));
    }

    /// Process one reassembled frame from a client. Returns `false` when
    /// the connection must be dropped.
    fn process_client_frame(&mut self, id: ClientId, mut frame: Vec<u8>, batch: &mut Batch) -> bool {
        if let Err(e) = self.pipeline.apply_receive(&mut frame) {
            warn!(client = id.0, error = %e, "receive transform failed, dropping packet");
            return true;
        }
        let header = match PacketHeader::parse(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!(client = id.0, error = %e, "malformed packet header");
                return false;
            }
        };
        if !version_ok(&self.config, &header) {
            warn!(client = id.0, "stream packet below version floor, dropping connection");
            return false;
        }
        let Some(expected) = self.clients.get(id).map(|r| r.secret) else {
            return false;
        };
        if header.sender_secret != expected {
            warn!(client = id.0, "packet secret mismatch, dropped");
            return true;
        }
        for message in iter_messages(&frame) {
            match message {
                Ok(bytes) => self.handle_client_message(id, bytes, batch),
                Err(e) => {
                    warn!(client = id.0, error = %e, "message framing error");
                    break;
                }
            }
        }
        true
    }

    /// Dispatch one message from an admitted client: execute, relay, or
    /// drop per the permission table.
    fn handle_client_message(&mut self, id: ClientId, message: &[u8], batch: &mut Batch) {
        let mut input = message;
        let header = match RpcHeader::read(&mut input) {
            Ok(h) => h,
            Err(e) => {
                warn!(client = id.0, error = %e, "unreadable rpc header");
                return;
            }
        };

        if header.rpc_id.is_control() {
            match ControlMessage::decode(&header, &mut input) {
                Ok(ControlMessage::Ping(request)) => self.route_ping(request, batch),
                Ok(other) => {
                    debug!(client = id.0, rpc = other.rpc_id().0, "unexpected control message");
                }
                Err(e) => warn!(client = id.0, error = %e, "undecodable control message"),
            }
            return;
        }

        let Some(def) = self.rpc_table.def(header.rpc_id) else {
            warn!(client = id.0, rpc = header.rpc_id.0, "unknown rpc id");
            return;
        };
        let (permission, transport, has_callee) =
            (def.permission, def.transport, def.has_callee_param());

        if header.caller != id {
            warn!(
                client = id.0,
                claimed = header.caller.0,
                "caller spoofing detected, message dropped"
            );
            return;
        }

        let authority = ClientId::NONE;
        if !permission.allows(header.caller, header.callee, authority) {
            warn!(
                client = id.0,
                rpc = header.rpc_id.0,
                "permission violation, correcting caller's view"
            );
            let correction =
                ControlMessage::HostMigration(authority).encode(ClientId::NONE, id);
            if let Some(record) = self.clients.get_mut(id) {
                record.tcp_packet.push_message(&correction);
            }
            return;
        }

        match permission {
            RpcPermission::ClientsToAuthority => {
                batch.rpc.push(SessionEvent::Rpc {
                    header,
                    args: input.to_vec(),
                });
            }
            RpcPermission::ClientsToClients => {
                let recipients = if has_callee && !header.callee.is_none() {
                    Recipients::One(header.callee)
                } else {
                    Recipients::AllExcept(id)
                };
                self.relay_raw(message, transport, recipients);
            }
            RpcPermission::ClientsToAll | RpcPermission::AnyToAll => {
                if has_callee && !header.callee.is_none() {
                    self.relay_raw(message, transport, Recipients::One(header.callee));
                } else {
                    batch.rpc.push(SessionEvent::Rpc {
                        header,
                        args: input.to_vec(),
                    });
                    self.relay_raw(message, transport, Recipients::AllExcept(id));
                }
            }
            // The permission check already rejected a non-authority caller.
            RpcPermission::AuthorityToClients => {}
        }
    }

    /// Copy a raw message into the matching per-client packets.
    fn relay_raw(&mut self, message: &[u8], transport: Transport, recipients: Recipients) {
        for record in self.clients.iter_mut() {
            let wanted = match recipients {
                Recipients::All => true,
                Recipients::AllExcept(excluded) => record.id != excluded,
                Recipients::One(id) => record.id == id,
            };
            if !wanted {
                continue;
            }
            match transport {
                Transport::Stream => record.tcp_packet.push_message(message),
                Transport::Datagram => record.udp_packet.push_message(message),
            }
        }
    }

    /// Ping routing: answer probes addressed to the server, forward legs
    /// between clients, resolve echoes of our own probes.
    fn route_ping(&mut self, mut request: PingRequest, batch: &mut Batch) {
        let now = now_ms();
        let request_leg = request.receive_time_ms == 0;
        if request_leg {
            if request.target.is_none() {
                request.receive_time_ms = now;
                self.push_control_to(
                    request.source,
                    &ControlMessage::Ping(request),
                );
            } else {
                let target = request.target;
                self.push_control_to(target, &ControlMessage::Ping(request));
            }
        } else if request.source.is_none() {
            if let Some(resolved) = self.pings.resolve(&request, now) {
                batch.control.push(SessionEvent::PingResolved(resolved));
            }
        } else {
            let source = request.source;
            self.push_control_to(source, &ControlMessage::Ping(request));
        }
    }

    fn push_control_to(&mut self, id: ClientId, message: &ControlMessage) {
        let Some(record) = self.clients.get_mut(id) else {
            debug!(client = id.0, "control message for unknown client dropped");
            return;
        };
        record
            .tcp_packet
            .push_message(&message.encode(ClientId::NONE, id));
    }

    fn process_datagram(&mut self, src: SocketAddr, mut frame: Vec<u8>, batch: &mut Batch) {
        if let Err(e) = self.pipeline.apply_receive(&mut frame) {
            warn!(from = %src, error = %e, "datagram transform failed");
            return;
        }
        let header = match PacketHeader::parse(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!(from = %src, error = %e, "malformed datagram header");
                return;
            }
        };
        if !version_ok(&self.config, &header) {
            warn!(from = %src, "datagram below version floor dropped");
            return;
        }

        // Identify the sender: admission datagrams carry no secret yet,
        // everything else must come from a known UDP address with the
        // matching secret.
        let known = self.clients.by_udp_addr(src);
        for message in iter_messages(&frame) {
            let bytes = match message {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(from = %src, error = %e, "datagram framing error");
                    break;
                }
            };
            let mut input = bytes;
            let rpc_header = match RpcHeader::read(&mut input) {
                Ok(h) => h,
                Err(e) => {
                    warn!(from = %src, error = %e, "unreadable datagram rpc header");
                    continue;
                }
            };
            if rpc_header.rpc_id == alderwire_protocol::types::RpcId::CONNECTION_REQUEST {
                match ControlMessage::decode(&rpc_header, &mut input) {
                    Ok(ControlMessage::ConnectionRequest(request)) => {
                        self.handle_admission(src, &request)
                    }
                    Ok(_) | Err(_) => warn!(from = %src, "malformed connection request"),
                }
                continue;
            }
            let Some(id) = known else {
                debug!(from = %src, "datagram from unknown address dropped");
                continue;
            };
            let expected = self.clients.get(id).map(|r| r.secret).unwrap_or(0);
            if header.sender_secret != expected {
                warn!(client = id.0, "datagram secret mismatch, dropped");
                continue;
            }
            self.handle_client_message(id, bytes, batch);
        }
    }
}

impl Buffer for ServerBuffer {
    fn open(&mut self) -> Result<Vec<SessionEvent>> {
        Ok(Vec::new())
    }

    fn receive(&mut self) -> Result<Vec<SessionEvent>> {
        let mut batch = Batch::default();
        batch.control.append(&mut self.backlog);
        if !self.active {
            return Ok(batch.into_events());
        }

        self.pending.sweep();

        let mut datagrams = Vec::new();
        drain_datagrams(&self.udp, &mut datagrams)?;
        for (src, frame) in datagrams {
            self.process_datagram(src, frame, &mut batch);
        }

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.complete_admission(stream, peer, &mut batch),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "listener accept failed");
                    break;
                }
            }
        }

        let mut dead = Vec::new();
        let mut inbound = Vec::new();
        for id in self.clients.ids() {
            let Some(record) = self.clients.get_mut(id) else {
                continue;
            };
            let mut frames = Vec::new();
            match drain_stream(&mut record.stream, &mut record.assembler, &mut frames) {
                Ok(false) => {}
                Ok(true) => dead.push(id),
                Err(e) => {
                    warn!(client = id.0, error = %e, "stream drain failed");
                    dead.push(id);
                }
            }
            inbound.push((id, frames));
        }
        for (id, frames) in inbound {
            for frame in frames {
                if !self.process_client_frame(id, frame, &mut batch) {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.drop_client(id, &mut batch.control);
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
        let mut dead = Vec::new();
        let mut header = base_header(&self.config, ClientId::NONE, 0);
        for record in self.clients.iter_mut() {
            if let Err(e) = flush_stream(
                &mut record.stream,
                &mut record.tcp_packet,
                &mut header,
                &self.pipeline,
            ) {
                warn!(client = record.id.0, error = %e, "stream flush failed");
                dead.push(record.id);
                continue;
            }
            if let Err(e) = flush_datagram(
                &self.udp,
                record.udp_addr,
                &mut record.udp_packet,
                &mut header,
                &self.pipeline,
            ) {
                warn!(client = record.id.0, error = %e, "datagram flush failed");
            }
        }
        for id in dead {
            let mut events = Vec::new();
            self.drop_client(id, &mut events);
            self.backlog.append(&mut events);
        }
        Ok(())
    }

    fn enqueue(&mut self, message: OutboundMessage) {
        self.relay_raw(&message.payload, message.transport, message.recipients);
    }

    fn disconnect_all(&mut self) {
        if !self.active {
            return;
        }
        for id in self.clients.ids() {
            if let Some(record) = self.clients.remove(id) {
                let _ = record.stream.shutdown(std::net::Shutdown::Both);
            }
        }
        self.active = false;
        self.backlog.push(SessionEvent::LocalDisconnected);
        info!("server shut down");
    }

    fn disconnect_client(&mut self, id: ClientId) -> Result<()> {
        if self.clients.get(id).is_none() {
            return Err(SessionError::UnknownClient(id.0));
        }
        let mut events = Vec::new();
        self.drop_client(id, &mut events);
        self.backlog.append(&mut events);
        Ok(())
    }

    fn migrate_host(&mut self, _new_host: ClientId) -> Result<()> {
        Err(SessionError::NotMigratable)
    }

    fn ping(&mut self, target: ClientId) -> PingRequest {
        let now = now_ms();
        if target.is_none() {
            // Pinging ourselves: resolve locally without touching a socket.
            let mut request = PingRequest::new(ClientId::NONE, ClientId::NONE, now);
            request.receive_time_ms = now;
            request.response_time_ms = now;
            request.resolved = true;
            self.backlog.push(SessionEvent::PingResolved(request));
            return request;
        }
        let request = self.pings.begin(ClientId::NONE, target, now);
        self.push_control_to(target, &ControlMessage::Ping(request));
        request
    }

    fn local_id(&self) -> ClientId {
        ClientId::NONE
    }

    fn authority(&self) -> ClientId {
        ClientId::NONE
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        match (self.listener.local_addr(), self.udp.local_addr()) {
            (Ok(tcp), Ok(udp)) => Some((tcp, udp)),
            _ => None,
        }
    }
}
