// Outstanding-ping bookkeeping.
//
// The source endpoint keeps one entry per in-flight probe. The echo leg is
// matched back to its entry by (source, target, send time) — a peer cannot
// resolve someone else's probe by guessing, since the send timestamp rides
// along. Unanswered probes expire after three seconds and resolve locally
// as failed.

use std::time::{Duration, Instant};

use alderwire_protocol::control::PingRequest;
use alderwire_protocol::types::ClientId;

/// How long a probe may stay unanswered.
pub const PING_TIMEOUT: Duration = Duration::from_millis(3000);

struct PendingPing {
    request: PingRequest,
    issued_at: Instant,
}

pub(crate) struct PingList {
    entries: Vec<PendingPing>,
}

impl PingList {
    pub fn new() -> PingList {
        PingList {
            entries: Vec::new(),
        }
    }

    /// Start tracking a probe toward `target`.
    pub fn begin(&mut self, source: ClientId, target: ClientId, send_time_ms: i64) -> PingRequest {
        let request = PingRequest::new(source, target, send_time_ms);
        self.entries.push(PendingPing {
            request,
            issued_at: Instant::now(),
        });
        request
    }

    /// Resolve the entry matching an echoed request. Stamps the response
    /// time and returns the finished request, or `None` for strays.
    pub fn resolve(&mut self, echo: &PingRequest, response_time_ms: i64) -> Option<PingRequest> {
        let index = self.entries.iter().position(|e| {
            e.request.source == echo.source
                && e.request.target == echo.target
                && e.request.send_time_ms == echo.send_time_ms
        })?;
        let mut request = self.entries.remove(index).request;
        request.receive_time_ms = echo.receive_time_ms;
        request.response_time_ms = response_time_ms;
        request.resolved = true;
        Some(request)
    }

    /// Expire overdue probes; each comes back failed and resolved.
    pub fn sweep(&mut self) -> Vec<PingRequest> {
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            if e.issued_at.elapsed() >= PING_TIMEOUT {
                let mut request = e.request;
                request.resolved = true;
                request.failed = true;
                expired.push(request);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_matches_by_source_target_and_send_time() {
        let mut list = PingList::new();
        let request = list.begin(ClientId(2), ClientId(3), 1000);

        let mut echo = request;
        echo.receive_time_ms = 1010;
        let resolved = list.resolve(&echo, 1022).unwrap();
        assert!(resolved.resolved);
        assert!(!resolved.failed);
        assert_eq!(resolved.receive_time_ms, 1010);
        assert_eq!(resolved.ping_ms(), 22);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn stray_echo_is_ignored() {
        let mut list = PingList::new();
        list.begin(ClientId(2), ClientId(3), 1000);

        let stray = PingRequest::new(ClientId(2), ClientId(3), 9999);
        assert!(list.resolve(&stray, 1022).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn sweep_fails_overdue_probes() {
        let mut list = PingList::new();
        list.begin(ClientId(2), ClientId(3), 1000);
        // Backdate the probe instead of sleeping out the timeout.
        list.entries[0].issued_at = Instant::now() - PING_TIMEOUT;
        let expired = list.sweep();
        assert_eq!(expired.len(), 1);
        assert!(expired[0].failed);
        assert!(expired[0].resolved);
        assert_eq!(list.len(), 0);
    }
}
