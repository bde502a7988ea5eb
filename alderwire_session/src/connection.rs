// Connection façade.
//
// Composes a role buffer, the spawner, the protocol registry and the event
// subscriber lists behind one public API. Two driving modes:
//
// - **Threaded** (default): a worker thread owns the buffer and all
//   sockets. It services control requests, drains the sockets, flushes
//   outbound packets, and sleeps whatever remains of `thread_update_delta`.
//   Decoded events cross to the caller over an mpsc channel drained by
//   `execute_queue()`; control requests cross the other way on a second
//   channel. `send`/`receive`/`await_connection` are invalid in this mode.
//
// - **Synchronous**: the caller drives `receive()`, `execute_queue()`,
//   `send()` once per tick on its own thread.
//
// Application callbacks and RPC handlers always run on the caller's thread,
// inside `execute_queue()`. That is also where the authority performs
// late-join spawn replay: when it observes `ClientConnected`, the replay
// control messages are queued before any user callback runs, so they
// precede whatever RPCs the application sends in response to the join.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use alderwire_protocol::control::{ControlMessage, PingRequest};
use alderwire_protocol::rpc::{decode_args, encode_rpc, ArgValue, RpcHeader};
use alderwire_protocol::transform::{BandwidthMeter, BandwidthSnapshot, TransformStep};
use alderwire_protocol::types::{ClientId, NetworkId, RpcId, Transport};

use crate::buffer::{build_pipeline, Buffer};
use crate::client::ClientBuffer;
use crate::config::{Config, Role};
use crate::error::{Result, SessionError};
use crate::events::ConnectionEvents;
use crate::message::{OutboundMessage, Recipients, SessionEvent};
use crate::registry::{ProtocolRegistry, RpcContext};
use crate::relay::RelayBuffer;
use crate::server::ServerBuffer;
use crate::spawner::{NetworkObject, Spawner, TypeRegistry};

/// Requests the caller sends to the I/O loop.
pub(crate) enum ControlRequest {
    Enqueue(OutboundMessage),
    DisconnectClient(ClientId),
    DisconnectAll,
    MigrateHost(ClientId),
    Ping(ClientId),
}

struct Worker {
    request_tx: Sender<ControlRequest>,
    keep_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

enum Backend {
    Sync(Box<dyn Buffer>),
    Threaded(Worker),
}

/// A session endpoint: server, client, or relay, per its configuration.
pub struct Connection {
    config: Arc<Config>,
    backend: Backend,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
    registry: ProtocolRegistry,
    spawner: Spawner,
    /// Subscriber lists; fired from `execute_queue` on the caller's thread.
    pub events: ConnectionEvents,
    meter: Arc<BandwidthMeter>,
    listen_addrs: Option<(SocketAddr, SocketAddr)>,
    local_id: ClientId,
    authority: ClientId,
    is_host: bool,
    active: bool,
    peers: Vec<ClientId>,
}

impl Connection {
    /// Build the endpoint for `config.role` and start it. In threaded mode
    /// the worker begins connecting/listening immediately; in synchronous
    /// mode a client waits for [`Connection::await_connection`].
    pub fn start(
        config: Config,
        registry: ProtocolRegistry,
        types: TypeRegistry,
    ) -> Result<Connection> {
        Connection::start_with_transforms(config, registry, types, Vec::new())
    }

    /// Like [`Connection::start`], with user transform steps added to the
    /// pipeline at their chosen priorities (0, 100 and 200 are reserved).
    pub fn start_with_transforms(
        config: Config,
        registry: ProtocolRegistry,
        types: TypeRegistry,
        user_steps: Vec<(i32, Box<dyn TransformStep>)>,
    ) -> Result<Connection> {
        config.validate()?;
        let config = Arc::new(config);
        let rpc_table = registry.table();
        let meter = BandwidthMeter::new();
        let pipeline = build_pipeline(&config, &meter, user_steps)?;

        let mut buffer: Box<dyn Buffer> = match config.role {
            Role::Server => Box::new(ServerBuffer::new(
                config.clone(),
                rpc_table.clone(),
                pipeline,
            )?),
            Role::Client | Role::Host => Box::new(ClientBuffer::new(config.clone(), pipeline)?),
            Role::Relay => Box::new(RelayBuffer::new(
                config.clone(),
                rpc_table.clone(),
                pipeline,
            )?),
        };
        let listen_addrs = buffer.local_addrs();
        let (event_tx, event_rx) = mpsc::channel();

        let backend = if config.threaded {
            let (request_tx, request_rx) = mpsc::channel();
            let keep_running = Arc::new(AtomicBool::new(true));
            let delta = config.update_delta();
            let worker_tx = event_tx.clone();
            let worker_flag = keep_running.clone();
            let handle = thread::Builder::new()
                .name("alderwire-io".into())
                .spawn(move || worker_loop(buffer, request_rx, worker_tx, worker_flag, delta))?;
            Backend::Threaded(Worker {
                request_tx,
                keep_running,
                handle: Some(handle),
            })
        } else {
            if !config.role.is_client_side() {
                for event in buffer.open()? {
                    let _ = event_tx.send(event);
                }
            }
            Backend::Sync(buffer)
        };

        let active = !config.role.is_client_side();
        Ok(Connection {
            backend,
            event_tx,
            event_rx,
            registry,
            spawner: Spawner::new(types),
            events: ConnectionEvents::default(),
            meter,
            listen_addrs,
            local_id: ClientId::NONE,
            authority: ClientId::NONE,
            is_host: false,
            active,
            peers: Vec::new(),
            config,
        })
    }

    fn request(&mut self, request: ControlRequest) -> Result<()> {
        match &mut self.backend {
            Backend::Sync(buffer) => match request {
                ControlRequest::Enqueue(message) => {
                    buffer.enqueue(message);
                    Ok(())
                }
                ControlRequest::DisconnectClient(id) => buffer.disconnect_client(id),
                ControlRequest::DisconnectAll => {
                    buffer.disconnect_all();
                    Ok(())
                }
                ControlRequest::MigrateHost(id) => buffer.migrate_host(id),
                ControlRequest::Ping(target) => {
                    let _ = buffer.ping(target);
                    Ok(())
                }
            },
            Backend::Threaded(worker) => worker
                .request_tx
                .send(request)
                .map_err(|_| SessionError::NotConnected),
        }
    }

    /// Synchronous mode only: drive the admission handshake (clients) or
    /// confirm the listen sockets (server/relay).
    pub fn await_connection(&mut self) -> Result<()> {
        let event_tx = self.event_tx.clone();
        match &mut self.backend {
            Backend::Threaded(_) => Err(SessionError::InvalidState(
                "await_connection is driven by the worker in threaded mode",
            )),
            Backend::Sync(buffer) => {
                for event in buffer.open()? {
                    let _ = event_tx.send(event);
                }
                Ok(())
            }
        }
    }

    /// Synchronous mode only: drain the sockets.
    pub fn receive(&mut self) -> Result<()> {
        let event_tx = self.event_tx.clone();
        match &mut self.backend {
            Backend::Threaded(_) => Err(SessionError::InvalidState(
                "receive is driven by the worker in threaded mode",
            )),
            Backend::Sync(buffer) => {
                for event in buffer.receive()? {
                    let _ = event_tx.send(event);
                }
                Ok(())
            }
        }
    }

    /// Synchronous mode only: flush outbound packets.
    pub fn send(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Threaded(_) => Err(SessionError::InvalidState(
                "send is driven by the worker in threaded mode",
            )),
            Backend::Sync(buffer) => buffer.send(),
        }
    }

    /// Process every queued event on the caller's thread: lifecycle
    /// callbacks, RPC dispatch, late-join replay, pending lookups.
    pub fn execute_queue(&mut self) {
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => self.apply_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.active {
                        self.active = false;
                        self.events.local_disconnected.emit(&());
                    }
                    break;
                }
            }
        }
        self.spawner.drain_lookups();
    }

    fn apply_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ClientConnected(id) => {
                self.peers.push(id);
                if self.is_authority() {
                    self.replay_spawns_to(id);
                }
                self.events.client_connected.emit(&id);
            }
            SessionEvent::LocalConnected(assignment) => {
                self.local_id = assignment.assigned_id;
                self.authority = assignment.authority_id;
                self.is_host = !assignment.assigned_id.is_none()
                    && assignment.assigned_id == assignment.authority_id;
                self.active = true;
                self.events.local_connected.emit(&assignment);
            }
            SessionEvent::ClientDisconnected(id) => {
                self.peers.retain(|peer| *peer != id);
                self.events.client_disconnected.emit(&id);
            }
            SessionEvent::HostMigrated(new_authority) => {
                self.authority = new_authority;
                if self.config.role.is_client_side() {
                    self.is_host =
                        !self.local_id.is_none() && self.local_id == new_authority;
                }
                self.events.host_migration.emit(&new_authority);
            }
            SessionEvent::LocalDisconnected => {
                if self.active {
                    self.active = false;
                    self.events.local_disconnected.emit(&());
                }
            }
            SessionEvent::PingResolved(request) => {
                self.events.ping_resolved.emit(&request);
            }
            SessionEvent::Spawned { notice, owner } => {
                self.spawner.apply_remote_spawn(notice, owner);
                self.events.object_spawned.emit(&notice);
            }
            SessionEvent::Despawned(id) => {
                self.spawner.apply_remote_despawn(id);
                self.events.object_despawned.emit(&id);
            }
            SessionEvent::Rpc { header, args } => self.dispatch_rpc(header, args),
        }
    }

    /// Late-join reconciliation: one spawn message per live object, in
    /// issue order, addressed to the newcomer — queued before any user
    /// callback can react to the join.
    fn replay_spawns_to(&mut self, newcomer: ClientId) {
        let notices = self.spawner.replay();
        if notices.is_empty() {
            return;
        }
        debug!(client = newcomer.0, objects = notices.len(), "late-join spawn replay");
        let caller = self.local_id;
        for notice in notices {
            let payload = ControlMessage::Spawn(notice).encode(caller, newcomer);
            let _ = self.request(ControlRequest::Enqueue(OutboundMessage {
                payload,
                transport: Transport::Stream,
                recipients: Recipients::One(newcomer),
            }));
        }
    }

    fn dispatch_rpc(&mut self, header: RpcHeader, args: Vec<u8>) {
        let Some(def) = self.registry.def(header.rpc_id) else {
            warn!(rpc = header.rpc_id.0, "rpc without definition dropped");
            return;
        };
        let params = def.params.clone();
        let (caller_index, callee_index) = (def.caller_index, def.callee_index);

        let mut input = args.as_slice();
        let decoded = match decode_args(&params, caller_index, callee_index, &header, &mut input) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(rpc = header.rpc_id.0, error = %e, "argument decode failed, rpc dropped");
                return;
            }
        };
        let ctx = RpcContext {
            rpc_id: header.rpc_id,
            caller: header.caller,
            callee: header.callee,
            target: header.target,
        };
        let handled = self.registry.dispatch(&ctx, &decoded);
        let mut object_handled = false;
        if !header.target.is_none() {
            object_handled = self
                .spawner
                .dispatch_rpc(header.target, header.rpc_id, &decoded);
            if !object_handled {
                debug!(
                    rpc = header.rpc_id.0,
                    target = header.target.0,
                    "rpc target object not present"
                );
            }
        }
        if !handled && !object_handled {
            debug!(rpc = header.rpc_id.0, "rpc had no handler");
        }
    }

    /// Encode and queue an RPC. The permission table is checked from the
    /// local view before anything is encoded.
    pub fn send_rpc(
        &mut self,
        rpc_id: RpcId,
        callee: ClientId,
        target: NetworkId,
        args: &[ArgValue],
    ) -> Result<()> {
        if !self.active {
            return Err(SessionError::NotConnected);
        }
        let def = self
            .registry
            .def(rpc_id)
            .ok_or(SessionError::UnknownRpc(rpc_id.0))?;
        if def.params.len() != args.len() {
            return Err(SessionError::Config(format!(
                "rpc {} expects {} arguments, got {}",
                rpc_id.0,
                def.params.len(),
                args.len()
            )));
        }
        for (index, (kind, arg)) in def.params.iter().zip(args).enumerate() {
            if *kind != arg.kind() {
                return Err(SessionError::Wire(
                    alderwire_protocol::WireError::ArgKindMismatch {
                        index,
                        expected: kind.name(),
                        got: arg.kind().name(),
                    },
                ));
            }
        }
        if !def.permission.allows(self.local_id, callee, self.authority) {
            return Err(SessionError::PermissionDenied { rpc_id: rpc_id.0 });
        }
        let (transport, caller_index, callee_index) =
            (def.transport, def.caller_index, def.callee_index);

        let header = RpcHeader {
            rpc_id,
            caller: self.local_id,
            callee,
            target,
        };
        let mut payload = Vec::new();
        encode_rpc(&header, args, caller_index, callee_index, &mut payload)?;
        let recipients = if callee.is_none() {
            Recipients::All
        } else {
            Recipients::One(callee)
        };
        self.request(ControlRequest::Enqueue(OutboundMessage {
            payload,
            transport,
            recipients,
        }))
    }

    /// Spawn a replicated object (authority only). The spawn notice goes
    /// out on the stream transport to every peer.
    pub fn spawn(&mut self, type_tag: u8) -> Result<NetworkId> {
        if !self.is_authority() {
            return Err(SessionError::InvalidState(
                "only the authority spawns objects",
            ));
        }
        let notice = self.spawner.spawn_local(type_tag, self.local_id)?;
        let payload = ControlMessage::Spawn(notice).encode(self.local_id, ClientId::NONE);
        self.request(ControlRequest::Enqueue(OutboundMessage {
            payload,
            transport: Transport::Stream,
            recipients: Recipients::All,
        }))?;
        self.events.object_spawned.emit(&notice);
        Ok(notice.id)
    }

    /// Remove a replicated object (authority only).
    pub fn despawn(&mut self, id: NetworkId) -> Result<()> {
        if !self.is_authority() {
            return Err(SessionError::InvalidState(
                "only the authority despawns objects",
            ));
        }
        self.spawner.despawn_local(id)?;
        let payload = ControlMessage::Despawn(id).encode(self.local_id, ClientId::NONE);
        self.request(ControlRequest::Enqueue(OutboundMessage {
            payload,
            transport: Transport::Stream,
            recipients: Recipients::All,
        }))?;
        self.events.object_despawned.emit(&id);
        Ok(())
    }

    /// Start a latency probe. Resolution arrives through the
    /// `ping_resolved` event; a self-ping resolves before this returns.
    pub fn ping(&mut self, target: ClientId) -> Result<PingRequest> {
        if !self.active {
            return Err(SessionError::NotConnected);
        }
        if target == self.local_id {
            let now = crate::buffer::now_ms();
            let mut request = PingRequest::new(self.local_id, target, now);
            request.receive_time_ms = now;
            request.response_time_ms = now;
            request.resolved = true;
            self.events.ping_resolved.emit(&request);
            return Ok(request);
        }
        match &mut self.backend {
            Backend::Sync(buffer) => Ok(buffer.ping(target)),
            Backend::Threaded(worker) => {
                worker
                    .request_tx
                    .send(ControlRequest::Ping(target))
                    .map_err(|_| SessionError::NotConnected)?;
                // Provisional snapshot; the worker stamps the wire copy.
                Ok(PingRequest::new(
                    self.local_id,
                    target,
                    crate::buffer::now_ms(),
                ))
            }
        }
    }

    /// Move the authority role (relay sessions). On a host client this
    /// forwards the request to the relay.
    pub fn migrate_host(&mut self, new_host: ClientId) -> Result<()> {
        self.request(ControlRequest::MigrateHost(new_host))
    }

    /// Drop one client (server/relay only).
    pub fn disconnect_client(&mut self, id: ClientId) -> Result<()> {
        self.request(ControlRequest::DisconnectClient(id))
    }

    /// Tear the endpoint down. The final lifecycle events still arrive
    /// through `execute_queue`.
    pub fn disconnect(&mut self) -> Result<()> {
        self.request(ControlRequest::DisconnectAll)
    }

    /// Stop the worker (if any) and drop the endpoint.
    pub fn stop(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        if let Backend::Threaded(worker) = &mut self.backend {
            worker.keep_running.store(false, Ordering::SeqCst);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    pub fn authority(&self) -> ClientId {
        self.authority
    }

    /// Whether this endpoint currently holds the authority role.
    pub fn is_authority(&self) -> bool {
        match self.config.role {
            Role::Server => true,
            Role::Relay => false,
            Role::Client | Role::Host => self.is_host,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Peers this endpoint has seen connect (and not yet disconnect).
    pub fn peers(&self) -> &[ClientId] {
        &self.peers
    }

    /// Bound (TCP, UDP) listen addresses of a server/relay endpoint.
    pub fn listen_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.listen_addrs
    }

    pub fn bandwidth(&self) -> BandwidthSnapshot {
        self.meter.snapshot()
    }

    pub fn object(&self, id: NetworkId) -> Option<&NetworkObject> {
        self.spawner.object(id)
    }

    pub fn object_count(&self) -> usize {
        self.spawner.len()
    }

    /// Next object id the local spawner would allocate.
    pub fn next_object_id(&self) -> u32 {
        self.spawner.next_id()
    }

    /// Register a callback that fires once the object with `id` exists
    /// locally (drained during `execute_queue`).
    pub fn lookup_object(&mut self, id: NetworkId, callback: Box<dyn FnOnce(&NetworkObject)>) {
        self.spawner.lookup(id, callback);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

fn apply_request(buffer: &mut dyn Buffer, request: ControlRequest) {
    match request {
        ControlRequest::Enqueue(message) => buffer.enqueue(message),
        ControlRequest::DisconnectClient(id) => {
            if let Err(error) = buffer.disconnect_client(id) {
                warn!(client = id.0, %error, "disconnect request failed");
            }
        }
        ControlRequest::DisconnectAll => buffer.disconnect_all(),
        ControlRequest::MigrateHost(id) => {
            if let Err(error) = buffer.migrate_host(id) {
                warn!(client = id.0, %error, "migration request failed");
            }
        }
        ControlRequest::Ping(target) => {
            let _ = buffer.ping(target);
        }
    }
}

/// The I/O loop of threaded mode. One iteration: service requests, drain
/// sockets, flush packets, sleep out the update delta.
fn worker_loop(
    mut buffer: Box<dyn Buffer>,
    request_rx: Receiver<ControlRequest>,
    event_tx: Sender<SessionEvent>,
    keep_running: Arc<AtomicBool>,
    delta: Duration,
) {
    match buffer.open() {
        Ok(events) => {
            for event in events {
                if event_tx.send(event).is_err() {
                    return;
                }
            }
        }
        Err(error) => {
            error!(%error, "endpoint startup failed");
            let _ = event_tx.send(SessionEvent::LocalDisconnected);
            return;
        }
    }
    info!("i/o worker running");

    while keep_running.load(Ordering::SeqCst) {
        let started = Instant::now();

        while let Ok(request) = request_rx.try_recv() {
            apply_request(buffer.as_mut(), request);
        }

        match buffer.receive() {
            Ok(events) => {
                for event in events {
                    if event_tx.send(event).is_err() {
                        // The caller is gone; shut the sockets and leave.
                        buffer.disconnect_all();
                        return;
                    }
                }
            }
            Err(error) => error!(%error, "receive pass failed"),
        }

        if let Err(error) = buffer.send() {
            error!(%error, "send pass failed");
        }

        if !buffer.is_active() {
            break;
        }

        let elapsed = started.elapsed();
        if elapsed < delta {
            thread::sleep(delta - elapsed);
        }
    }

    buffer.disconnect_all();
    if let Ok(events) = buffer.receive() {
        for event in events {
            let _ = event_tx.send(event);
        }
    }
    info!("i/o worker stopped");
}
