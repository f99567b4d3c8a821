use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct CounterState {
    request_sequence: u64,
    total_bytes_relayed: u64,
    open_requests: u64,
}

/// Point-in-time copy of the shared counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub request_sequence: u64,
    pub total_bytes_relayed: u64,
    pub open_requests: u64,
}

/// Process-wide relay counters behind a single mutex.
///
/// The lock is only held for the arithmetic itself, never across I/O.
#[derive(Debug, Default)]
pub struct SharedCounters {
    state: Mutex<CounterState>,
}

impl SharedCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        // Poisoning only means a holder panicked between two integer updates.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assigns the next sequence id and marks a request as open.
    pub fn open_request(&self) -> u64 {
        let mut state = self.lock();
        state.request_sequence += 1;
        state.open_requests += 1;
        state.request_sequence
    }

    pub fn close_request(&self) {
        let mut state = self.lock();
        state.open_requests = state.open_requests.saturating_sub(1);
    }

    pub fn record_bytes(&self, bytes: u64) {
        let mut state = self.lock();
        state.total_bytes_relayed = state.total_bytes_relayed.saturating_add(bytes);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let state = self.lock();
        CountersSnapshot {
            request_sequence: state.request_sequence,
            total_bytes_relayed: state.total_bytes_relayed,
            open_requests: state.open_requests,
        }
    }

    pub fn open_requests(&self) -> u64 {
        self.lock().open_requests
    }

    pub fn total_bytes_relayed(&self) -> u64 {
        self.lock().total_bytes_relayed
    }
}

/// Keeps one request open for as long as it lives.
///
/// Dropping it closes the request, so every exit path of a forward is
/// balanced, including early returns and panics.
pub struct OpenRequestGuard {
    counters: Arc<SharedCounters>,
    id: u64,
}

impl OpenRequestGuard {
    pub fn new(counters: Arc<SharedCounters>) -> Self {
        let id = counters.open_request();
        Self { counters, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for OpenRequestGuard {
    fn drop(&mut self) {
        self.counters.close_request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_guard_balances_open_requests() {
        let counters = SharedCounters::new();

        let first = OpenRequestGuard::new(counters.clone());
        let second = OpenRequestGuard::new(counters.clone());
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(counters.open_requests(), 2);

        drop(first);
        assert_eq!(counters.open_requests(), 1);
        drop(second);
        assert_eq!(counters.open_requests(), 0);

        // Sequence ids are never reused.
        assert_eq!(OpenRequestGuard::new(counters.clone()).id(), 3);
        assert_eq!(counters.open_requests(), 0);
    }

    #[test]
    fn test_close_never_underflows() {
        let counters = SharedCounters::new();
        counters.close_request();
        assert_eq!(counters.open_requests(), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let counters = SharedCounters::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = OpenRequestGuard::new(counters.clone());
                        counters.record_bytes(3);
                    }
                })
            })
            .collect();

        let mut last_total = 0;
        while counters.snapshot().request_sequence < 8000 {
            let total = counters.total_bytes_relayed();
            assert!(total >= last_total);
            last_total = total;
            thread::yield_now();
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.request_sequence, 8000);
        assert_eq!(snapshot.total_bytes_relayed, 24000);
        assert_eq!(snapshot.open_requests, 0);
    }
}
