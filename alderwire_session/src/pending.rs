// Pending-admission list.
//
// Phase one of admission arrives over UDP; phase two is the TCP handshake.
// Between the two, the accepted request waits here, keyed by the client's
// IP. Entries expire after the configured timeout and are swept at the
// start of every receive pass, so a client that got its Accepted datagram
// but never dialed in does not hold a capacity slot forever.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::debug;

pub(crate) struct PendingRequest {
    pub udp_addr: SocketAddr,
    pub as_host: bool,
    pub requested_at: Instant,
}

pub(crate) struct PendingList {
    entries: Vec<PendingRequest>,
    timeout: Duration,
}

impl PendingList {
    pub fn new(timeout: Duration) -> PendingList {
        PendingList {
            entries: Vec::new(),
            timeout,
        }
    }

    /// Record an accepted admission, refreshing any previous entry from the
    /// same address (clients re-send their request at a fixed rate).
    pub fn insert(&mut self, udp_addr: SocketAddr, as_host: bool) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.udp_addr == udp_addr) {
            existing.requested_at = Instant::now();
            existing.as_host = as_host;
            return;
        }
        self.entries.push(PendingRequest {
            udp_addr,
            as_host,
            requested_at: Instant::now(),
        });
    }

    /// Match an incoming TCP handshake by remote IP and consume the entry.
    pub fn take_by_ip(&mut self, ip: IpAddr) -> Option<PendingRequest> {
        let index = self.entries.iter().position(|e| e.udp_addr.ip() == ip)?;
        Some(self.entries.remove(index))
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let timeout = self.timeout;
        let before = self.entries.len();
        self.entries.retain(|e| e.requested_at.elapsed() < timeout);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "expired pending admissions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn insert_take_roundtrip() {
        let mut list = PendingList::new(Duration::from_secs(20));
        list.insert(addr(5000), false);
        list.insert(addr(5001), true);
        assert_eq!(list.len(), 2);

        let taken = list.take_by_ip("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(taken.udp_addr, addr(5000));
        assert_eq!(list.len(), 1);
        assert!(list.take_by_ip("10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn resend_refreshes_instead_of_duplicating() {
        let mut list = PendingList::new(Duration::from_secs(20));
        list.insert(addr(5000), false);
        list.insert(addr(5000), true);
        assert_eq!(list.len(), 1);
        let taken = list.take_by_ip("127.0.0.1".parse().unwrap()).unwrap();
        assert!(taken.as_host);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut list = PendingList::new(Duration::from_millis(0));
        list.insert(addr(5000), false);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(list.sweep(), 1);
        assert_eq!(list.len(), 0);
    }
}
