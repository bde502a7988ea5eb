// Per-client connection records and the client table.
//
// A server or relay owns one `ClientRecord` per admitted client: the TCP
// stream, the learned UDP address, one outbound packet per transport, the
// inbound reassembler, and the secret the client must echo in every packet
// header. The table mints ids monotonically starting at 1 — ids are never
// reused within a run, so a reconnecting client gets a fresh identity.
//
// Secrets are random, nonzero, and unique across currently connected
// clients; a header whose secret does not match its record is dropped
// without an answer.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};

use rand::Rng;

use alderwire_protocol::packet::{Packet, PacketAssembler};
use alderwire_protocol::types::ClientId;

pub(crate) struct ClientRecord {
    pub id: ClientId,
    pub secret: u32,
    pub stream: TcpStream,
    /// Learned from the admission datagram's source address.
    pub udp_addr: SocketAddr,
    pub tcp_packet: Packet,
    pub udp_packet: Packet,
    pub assembler: PacketAssembler,
    /// Whether this client asked for the authority role at admission.
    pub requested_host: bool,
}

/// Admission-ordered table of connected clients. `BTreeMap` keyed by id
/// keeps iteration in admission order, since ids are minted monotonically.
pub(crate) struct ClientTable {
    records: BTreeMap<ClientId, ClientRecord>,
    next_id: u32,
}

impl ClientTable {
    pub fn new() -> ClientTable {
        ClientTable {
            records: BTreeMap::new(),
            next_id: ClientId::FIRST.0,
        }
    }

    /// Admit a client: mint an id and a unique secret, build its record.
    pub fn admit(
        &mut self,
        stream: TcpStream,
        udp_addr: SocketAddr,
        buffer_size: usize,
        requested_host: bool,
    ) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        let secret = self.mint_secret();
        self.records.insert(
            id,
            ClientRecord {
                id,
                secret,
                stream,
                udp_addr,
                tcp_packet: Packet::outbound(buffer_size),
                udp_packet: Packet::outbound(buffer_size),
                assembler: PacketAssembler::new(),
                requested_host,
            },
        );
        id
    }

    fn mint_secret(&self) -> u32 {
        let mut rng = rand::rng();
        loop {
            let secret: u32 = rng.random();
            if secret != 0 && !self.records.values().any(|r| r.secret == secret) {
                return secret;
            }
        }
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.records.get_mut(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.records.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientRecord> {
        self.records.values_mut()
    }

    /// Find the record whose learned UDP address matches `addr`.
    pub fn by_udp_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.records
            .values()
            .find(|r| r.udp_addr == addr)
            .map(|r| r.id)
    }

    /// First client in admission order other than `excluded` — the
    /// deterministic host-migration fallback.
    pub fn first_other(&self, excluded: ClientId) -> Option<ClientId> {
        self.records.keys().copied().find(|id| *id != excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut table = ClientTable::new();
        let udp: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let (_a, sa) = stream_pair();
        let (_b, sb) = stream_pair();
        let (_c, sc) = stream_pair();

        let first = table.admit(sa, udp, 2048, false);
        let second = table.admit(sb, udp, 2048, false);
        assert_eq!(first, ClientId(1));
        assert_eq!(second, ClientId(2));

        table.remove(first);
        let third = table.admit(sc, udp, 2048, false);
        assert_eq!(third, ClientId(3), "freed ids must not be reused");
    }

    #[test]
    fn secrets_are_nonzero_and_distinct() {
        let mut table = ClientTable::new();
        let udp: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut secrets = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..8 {
            let (client, server) = stream_pair();
            keep.push(client);
            let id = table.admit(server, udp, 2048, false);
            secrets.push(table.get(id).unwrap().secret);
        }
        assert!(secrets.iter().all(|&s| s != 0));
        let mut deduped = secrets.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), secrets.len());
    }

    #[test]
    fn first_other_follows_admission_order() {
        let mut table = ClientTable::new();
        let udp: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut keep = Vec::new();
        for _ in 0..3 {
            let (client, server) = stream_pair();
            keep.push(client);
            table.admit(server, udp, 2048, false);
        }
        assert_eq!(table.first_other(ClientId(1)), Some(ClientId(2)));
        assert_eq!(table.first_other(ClientId(2)), Some(ClientId(1)));
        table.remove(ClientId(2));
        assert_eq!(table.first_other(ClientId(1)), Some(ClientId(3)));
    }
}
