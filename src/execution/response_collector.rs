//! Gathers the responses of an anycast fan-out until every branch answered.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::overlay::messages::{RequestId, Response};

struct Pending {
    expected: usize,
    received: usize,
    response: Response,
}

#[derive(Default)]
pub struct ResponseCollector {
    pending: Mutex<HashMap<RequestId, Pending>>,
    arrived: Condvar,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting `expected` responses for `id`.
    pub fn register(&self, id: RequestId, expected: usize) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Pending { expected, received: 0, response: Response::default() });
    }

    /// Record one response. Unknown ids are ignored.
    pub fn deliver(&self, id: RequestId, response: &Response) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = pending.get_mut(&id) {
            entry.received += 1;
            entry.response.merge(response);
            self.arrived.notify_all();
        }
    }

    /// Block until all responses for `id` arrived or `timeout` elapsed, then
    /// forget `id`. The merged response is returned in both cases, together
    /// with whether it is complete.
    pub fn wait(&self, id: RequestId, timeout: Duration) -> (Response, bool) {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let complete = pending.get(&id).map_or(true, |entry| entry.received >= entry.expected);
            let now = Instant::now();
            if complete || now >= deadline {
                let response = pending.remove(&id).map(|entry| entry.response).unwrap_or_default();
                return (response, complete);
            }
            pending = self
                .arrived
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::PeerId;
    use std::sync::Arc;
    use std::thread;

    fn id() -> RequestId {
        RequestId { origin: PeerId(0), sequence: 1 }
    }

    #[test]
    fn test_waits_for_every_branch() {
        let collector = Arc::new(ResponseCollector::new());
        collector.register(id(), 3);
        let handles: Vec<_> = (0..3)
            .map(|hops| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || collector.deliver(id(), &Response::handled(hops)))
            })
            .collect();

        let (response, complete) = collector.wait(id(), Duration::from_secs(5));
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(complete);
        assert_eq!(response.peers_reached, 3);
        assert_eq!(response.hops, 2);
    }

    #[test]
    fn test_timeout_returns_partial_response() {
        let collector = ResponseCollector::new();
        collector.register(id(), 2);
        collector.deliver(id(), &Response::handled(0));
        let (response, complete) = collector.wait(id(), Duration::from_millis(10));
        assert!(!complete);
        assert_eq!(response.peers_reached, 1);
    }
}
