// Relay endpoint.
//
// A relay admits clients exactly like a server but never executes
// application RPCs: for user ids it validates the claimed caller and the
// permission table, then forwards the raw message. One connected client
// holds the authority role — the first admitted, or the first admission
// from the pre-declared host address when one is configured (until that
// address shows up, everyone else is rejected).
//
// Spawn/despawn control messages from the authority are re-broadcast
// verbatim: to everyone else when unaddressed, or to a single client when
// the authority targets one (the late-join replay path).
//
// Host migration: triggered by the authority's explicit request or by its
// disconnect. Survivors get `ClientDisconnected` first, then
// `HostMigration` with the deterministic fallback pick (first remaining
// record in admission order). A non-migratable relay shuts down instead;
// an empty relay shuts down when configured to.

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

pub(crate) struct RelayBuffer {
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
    authority: ClientId,
    migratable: bool,
    /// Guards the shutdown-when-empty rule until the first client arrives.
    had_clients: bool,
    backlog: Vec<SessionEvent>,
    active: bool,
}

impl RelayBuffer {
    pub fn new(
        config: Arc<Config>,
        rpc_table: Arc<RpcTable>,
        pipeline: TransformPipeline,
    ) -> Result<RelayBuffer> {
        let listener = TcpListener::bind(config.tcp_addr())?;
        listener.set_nonblocking(true)?;
        let udp = UdpSocket::bind(config.udp_addr())?;
        udp.set_nonblocking(true)?;
        info!(tcp = %listener.local_addr()?, udp = %udp.local_addr()?, "relay listening");
        Ok(RelayBuffer {
            app_id: config.app_string_id()?,
            session_id: config.session_string_id()?,
            pending: PendingList::new(config.request_timeout()),
            pipeline,
            migratable: config.effective_migratable(),
            config,
            listener,
            udp,
            clients: ClientTable::new(),
            rpc_table,
            pings: PingList::new(),
            authority: ClientId::NONE,
            had_clients: false,
            backlog: Vec::new(),
            active: true,
        })
    }

    fn admission_code(&self, src: SocketAddr, request: &ConnectionRequest) -> ConnectionResponseCode {
        if request.app_id != self.app_id {
            return ConnectionResponseCode::IncorrectAppId;
        }
        if request.session_id != self.session_id {
            return ConnectionResponseCode::Rejected;
        }
        if let Some(whitelist) = &self.config.whitelist {
            if !whitelist.contains(&src.ip()) {
                return ConnectionResponseCode::Rejected;
            }
        }
        if self.clients.len() + self.pending.len() >= self.config.max_clients as usize {
            return ConnectionResponseCode::ServerFull;
        }
        if self.authority.is_none() {
            // Waiting for the host: with a pre-declared address, nobody
            // else gets in first.
            if let Some(host_ip) = self.config.host_addr {
                if src.ip() != host_ip {
                    return ConnectionResponseCode::Rejected;
                }
            }
        } else if request.as_host {
            return ConnectionResponseCode::HostAlreadyAssigned;
        }
        ConnectionResponseCode::Accepted
    }

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
        self.had_clients = true;
        if self.authority.is_none() {
            self.authority = id;
            info!(client = id.0, "authority assigned");
        }

        let secret = self.clients.get(id).map(|r| r.secret).unwrap_or(0);
        let assignment = ClientIdAssignment {
            assigned_id: id,
            authority_id: self.authority,
            client_secret: secret,
            max_clients: self.config.max_clients,
        };

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

    /// Move the authority role and tell everyone.
    fn migrate(&mut self, new_authority: ClientId, events: &mut Vec<SessionEvent>) -> Result<()> {
        if !self.migratable {
            return Err(SessionError::NotMigratable);
        }
        if self.clients.get(new_authority).is_none() {
            return Err(SessionError::UnknownClient(new_authority.0));
        }
        if new_authority == self.authority {
            return Ok(());
        }
        self.authority = new_authority;
        let notice =
            ControlMessage::HostMigration(new_authority).encode(ClientId::NONE, ClientId::NONE);
        for record in self.clients.iter_mut() {
            record.tcp_packet.push_message(&notice);
        }
        info!(client = new_authority.0, "authority migrated");
        events.push(SessionEvent::HostMigrated(new_authority));
        Ok(())
    }

    fn shutdown(&mut self, events: &mut Vec<SessionEvent>) {
        if !self.active {
            return;
        }
        for id in self.clients.ids() {
            if let Some(record) = self.clients.remove(id) {
                let _ = record.stream.shutdown(std::net::Shutdown::Both);
            }
        }
        self.active = false;
        events.push(SessionEvent::LocalDisconnected);
        info!("relay shut down");
    }

    fn drop_client(&mut self, id: ClientId, events: &mut Vec<SessionEvent>) {
        let Some(record) = self.clients.remove(id) else {
            return;
        };
        let _ = record.stream.shutdown(std::net::Shutdown::Both);
        info!(client = id.0, "client disconnected");

        // Survivors hear about the departure before any migration notice.
        let notice = ControlMessage::ClientDisconnected(id).encode(ClientId::NONE, ClientId::NONE);
        for remaining in self.clients.iter_mut() {
            remaining.tcp_packet.push_message(&notice);
        }
        events.push(SessionEvent::ClientDisconnected(id));

        if id == self.authority {
            self.authority = ClientId::NONE;
            if !self.migratable {
                info!("authority left a fixed session, shutting down");
                self.shutdown(events);
                return;
            }
            if let Some(next) = self.clients.first_other(id) {
                // Deterministic fallback: first surviving record in
                // admission order.
                let _ = self.migrate(next, events);
            }
        }

        if self.clients.is_empty() && self.had_clients && self.config.shutdown_when_empty {
            info!("last client left, shutting down");
            self.shutdown(events);
        }
    }

    /// Copy a raw message to every client the predicate selects.
    fn relay_where(
        &mut self,
        message: &[u8],
        transport: Transport,
        wanted: impl Fn(ClientId) -> bool,
    ) {
        for record in self.clients.iter_mut() {
            if !wanted(record.id) {
                continue;
            }
            match transport {
                Transport::Stream => record.tcp_packet.push_message(message),
                Transport::Datagram => record.udp_packet.push_message(message),
            }
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

    fn route_ping(&mut self, mut request: PingRequest, batch: &mut Batch) {
        let now = now_ms();
        let request_leg = request.receive_time_ms == 0;
        if request_leg {
            if request.target.is_none() {
                request.receive_time_ms = now;
                self.push_control_to(request.source, &ControlMessage::Ping(request));
            } else {
                // First leg rides the target's outbound packet.
                self.push_control_to(request.target, &ControlMessage::Ping(request));
            }
        } else if request.source.is_none() {
            if let Some(resolved) = self.pings.resolve(&request, now) {
                batch.control.push(SessionEvent::PingResolved(resolved));
            }
        } else {
            // Return leg rides the source's outbound packet.
            self.push_control_to(request.source, &ControlMessage::Ping(request));
        }
    }

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
                Ok(ControlMessage::Spawn(_)) | Ok(ControlMessage::Despawn(_)) => {
                    if id != self.authority {
                        warn!(client = id.0, "spawn control from non-authority dropped");
                        return;
                    }
                    // Re-broadcast verbatim; a concrete callee means a
                    // late-join replay addressed to one client.
                    if header.callee.is_none() {
                        self.relay_where(message, Transport::Stream, |c| c != id);
                    } else {
                        let callee = header.callee;
                        self.relay_where(message, Transport::Stream, |c| c == callee);
                    }
                }
                Ok(ControlMessage::HostMigration(new_authority)) => {
                    if id != self.authority {
                        warn!(client = id.0, "migration request from non-authority dropped");
                        return;
                    }
                    let mut events = Vec::new();
                    if let Err(e) = self.migrate(new_authority, &mut events) {
                        warn!(error = %e, "host migration request refused");
                    }
                    batch.control.append(&mut events);
                }
                Ok(other) => {
                    debug!(client = id.0, rpc = other.rpc_id().0, "unexpected control message");
                }
                Err(e) => warn!(client = id.0, error = %e, "undecodable control message"),
            }
            return;
        }

        // User RPC: inspect the header, validate, forward. Never executed
        // here.
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

        let authority = self.authority;
        if !permission.allows(header.caller, header.callee, authority) {
            warn!(
                client = id.0,
                rpc = header.rpc_id.0,
                "permission violation, correcting caller's view"
            );
            let correction = ControlMessage::HostMigration(authority).encode(ClientId::NONE, id);
            if let Some(record) = self.clients.get_mut(id) {
                record.tcp_packet.push_message(&correction);
            }
            return;
        }

        match permission {
            RpcPermission::ClientsToAuthority => {
                if authority.is_none() {
                    debug!(client = id.0, "no authority to deliver to");
                    return;
                }
                self.relay_where(message, transport, |c| c == authority);
            }
            RpcPermission::AuthorityToClients => {
                if has_callee && !header.callee.is_none() {
                    let callee = header.callee;
                    self.relay_where(message, transport, |c| c == callee);
                } else {
                    self.relay_where(message, transport, |c| c != id);
                }
            }
            RpcPermission::ClientsToClients => {
                if has_callee && !header.callee.is_none() {
                    let callee = header.callee;
                    self.relay_where(message, transport, |c| c == callee);
                } else {
                    // Broadcast between non-authorities only.
                    self.relay_where(message, transport, |c| c != id && c != authority);
                }
            }
            RpcPermission::ClientsToAll | RpcPermission::AnyToAll => {
                if has_callee && !header.callee.is_none() {
                    let callee = header.callee;
                    self.relay_where(message, transport, |c| c == callee);
                } else {
                    self.relay_where(message, transport, |c| c != id);
                }
            }
        }
    }

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

impl Buffer for RelayBuffer {
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
        let recipients = message.recipients;
        self.relay_where(&message.payload, message.transport, |c| match recipients {
            Recipients::All => true,
            Recipients::AllExcept(excluded) => c != excluded,
            Recipients::One(id) => c == id,
        });
    }

    fn disconnect_all(&mut self) {
        let mut events = Vec::new();
        self.shutdown(&mut events);
        self.backlog.append(&mut events);
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

    fn migrate_host(&mut self, new_host: ClientId) -> Result<()> {
        let mut events = Vec::new();
        let result = self.migrate(new_host, &mut events);
        self.backlog.append(&mut events);
        result
    }

    fn ping(&mut self, target: ClientId) -> PingRequest {
        let now = now_ms();
        if target.is_none() {
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
        self.authority
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::build_pipeline;
    use crate::config::Role;
    use crate::registry::ProtocolRegistry;
    use alderwire_protocol::types::StringId;
    use std::net::IpAddr;

    fn test_relay(configure: impl FnOnce(&mut Config)) -> RelayBuffer {
        let mut config = Config::default();
        config.role = Role::Relay;
        config.tcp_port = 0;
        config.udp_port = 0;
        config.app_id = "APP".into();
        config.session_id = "S1".into();
        configure(&mut config);
        let config = Arc::new(config);
        let meter = alderwire_protocol::transform::BandwidthMeter::new();
        let pipeline = build_pipeline(&config, &meter, Vec::new()).unwrap();
        RelayBuffer::new(config, ProtocolRegistry::new().table(), pipeline).unwrap()
    }

    fn request(as_host: bool) -> ConnectionRequest {
        ConnectionRequest {
            app_id: StringId::new("APP").unwrap(),
            session_id: StringId::new("S1").unwrap(),
            as_host,
        }
    }

    fn src(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 50_000)
    }

    #[test]
    fn predeclared_host_address_blocks_everyone_else() {
        let host_ip: IpAddr = "10.0.0.7".parse().unwrap();
        let relay = test_relay(|c| c.host_addr = Some(host_ip));

        // Until the declared host shows up, other addresses are turned away.
        assert_eq!(
            relay.admission_code(src("127.0.0.1"), &request(false)),
            ConnectionResponseCode::Rejected
        );
        assert_eq!(
            relay.admission_code(src("10.0.0.7"), &request(true)),
            ConnectionResponseCode::Accepted
        );
    }

    #[test]
    fn host_flag_after_assignment_gets_the_dedicated_code() {
        let mut relay = test_relay(|_| {});
        relay.authority = ClientId(1);
        assert_eq!(
            relay.admission_code(src("127.0.0.1"), &request(true)),
            ConnectionResponseCode::HostAlreadyAssigned
        );
        assert_eq!(
            relay.admission_code(src("127.0.0.1"), &request(false)),
            ConnectionResponseCode::Accepted
        );
    }

    #[test]
    fn migration_validates_target_and_policy() {
        let mut relay = test_relay(|c| c.migratable = true);
        let mut events = Vec::new();
        assert!(matches!(
            relay.migrate(ClientId(9), &mut events),
            Err(SessionError::UnknownClient(9))
        ));

        let mut fixed = test_relay(|c| {
            c.migratable = false;
            c.shutdown_when_empty = true;
        });
        assert!(matches!(
            fixed.migrate(ClientId(1), &mut events),
            Err(SessionError::NotMigratable)
        ));
    }

    #[test]
    fn keeping_an_empty_relay_up_forces_migratability() {
        let relay = test_relay(|c| {
            c.migratable = false;
            c.shutdown_when_empty = false;
        });
        assert!(relay.migratable);
    }

    #[test]
    fn relay_identity_is_fixed() {
        let relay = test_relay(|_| {});
        assert_eq!(relay.local_id(), ClientId::NONE);
        assert_eq!(relay.authority(), ClientId::NONE);
        assert!(relay.is_active());
    }
}
