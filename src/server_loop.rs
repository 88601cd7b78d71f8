//! A long-lived host thread that blocks on `replyAndReceive` and re-enters
//! the guest kernel (spec §4.H).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Outcome of one `replyAndReceive` call (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// `signaled_index` is a session handle; dispatch the request on it.
    Request { signaled_index: usize },
    /// `signaled_index` is a port handle; accept a new session.
    Accept { signaled_index: usize },
    /// No handle signaled within the requested timeout.
    Timeout,
}

/// The transport collaborator: everything about handles, IPC buffers and
/// dispatch lives outside this crate; `ServerLoop` only drives the
/// accept/dispatch/timeout state machine around it.
pub trait Transport {
    /// Blocks (up to `timeout_nanos`) until a port/session handle in
    /// `handles` is signaled, or `replyTarget` has been replied to.
    ///
    /// `port_count` is the number of leading entries in `handles` that are
    /// port handles; the rest are session handles (spec §4.H: "if
    /// `signaledIndex ≥ portCount` → session request").
    fn reply_and_receive(
        &self,
        handles: &[u64],
        port_count: usize,
        reply_target: Option<u64>,
        timeout_nanos: u64,
    ) -> ReceiveOutcome;

    /// Dispatches a request received on `session_handle`.
    fn dispatch(&self, session_handle: u64);

    /// Accepts a new session on `port_handle`.
    fn accept(&self, port_handle: u64);
}

/// Snapshot of the handle set this loop currently serves (spec §4.H:
/// "Snapshot (portHandles ∪ sessionHandles) under handleLock").
pub struct HandleSet {
    /// Port handles, followed by session handles — `port_count` marks the
    /// boundary the transport needs to classify a signaled index.
    handles: Mutex<(Vec<u64>, usize)>,
}

impl HandleSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: Mutex::new((Vec::new(), 0)),
        }
    }

    pub fn set_ports(&self, ports: &[u64], sessions: &[u64]) {
        let mut combined = Vec::with_capacity(ports.len() + sessions.len());
        combined.extend_from_slice(ports);
        combined.extend_from_slice(sessions);
        *self.handles.lock().unwrap() = (combined, ports.len());
    }

    fn snapshot(&self) -> (Vec<u64>, usize) {
        self.handles.lock().unwrap().clone()
    }
}

impl Default for HandleSet {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_TIMEOUT_NANOS: u64 = 1_000_000;

/// The steady-state server loop itself (spec §4.H). Not schedulable by the
/// guest scheduler — its host thread exists purely to pump IPC.
pub struct ServerLoop<T: Transport> {
    transport: T,
    handles: HandleSet,
    keep_running: AtomicBool,
}

impl<T: Transport> ServerLoop<T> {
    #[must_use]
    pub fn new(transport: T, handles: HandleSet) -> Self {
        Self {
            transport,
            handles,
            keep_running: AtomicBool::new(true),
        }
    }

    /// Runs the loop until [`Self::shutdown`] is called.
    ///
    /// Ordering guarantee (spec §4.H): a reply is only ever paired with the
    /// handle that delivered the request it replies to, carried here via
    /// `reply_target` threaded from one iteration's signaled handle into
    /// the next call.
    pub fn run(&self) {
        let mut reply_target: Option<u64> = None;
        while self.keep_running.load(Ordering::Acquire) {
            let (handles, port_count) = self.handles.snapshot();
            let outcome = self.transport.reply_and_receive(
                &handles,
                port_count,
                reply_target,
                DEFAULT_TIMEOUT_NANOS,
            );
            reply_target = None;
            match outcome {
                ReceiveOutcome::Request { signaled_index } => {
                    let handle = handles[signaled_index];
                    self.transport.dispatch(handle);
                    reply_target = Some(handle);
                }
                ReceiveOutcome::Accept { signaled_index } => {
                    self.transport.accept(handles[signaled_index]);
                }
                ReceiveOutcome::Timeout => {}
            }
        }
        log::debug!("server loop shut down");
    }

    /// Signals the loop to stop after its current `reply_and_receive` call
    /// returns (SPEC_FULL §C.5).
    pub fn shutdown(&self) {
        self.keep_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedTransport {
        outcomes: StdMutex<Vec<ReceiveOutcome>>,
        replies_seen: StdMutex<Vec<(Option<u64>, Option<u64>)>>,
        dispatched: StdMutex<Vec<u64>>,
        accepted: StdMutex<Vec<u64>>,
    }

    impl Transport for ScriptedTransport {
        fn reply_and_receive(
            &self,
            handles: &[u64],
            _port_count: usize,
            reply_target: Option<u64>,
            _timeout_nanos: u64,
        ) -> ReceiveOutcome {
            self.replies_seen
                .lock()
                .unwrap()
                .push((reply_target, handles.first().copied()));
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(ReceiveOutcome::Timeout)
        }

        fn dispatch(&self, session_handle: u64) {
            self.dispatched.lock().unwrap().push(session_handle);
        }

        fn accept(&self, port_handle: u64) {
            self.accepted.lock().unwrap().push(port_handle);
        }
    }

    #[test]
    fn dispatch_then_reply_is_paired_with_the_signaling_handle() {
        // Script runs in reverse pop order: Request first, then Timeout to exit.
        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![
                ReceiveOutcome::Timeout,
                ReceiveOutcome::Request { signaled_index: 1 },
            ]),
            replies_seen: StdMutex::new(Vec::new()),
            dispatched: StdMutex::new(Vec::new()),
            accepted: StdMutex::new(Vec::new()),
        };
        let handles = HandleSet::new();
        handles.set_ports(&[100], &[200]);
        let server = ServerLoop::new(transport, handles);

        // Run two iterations manually by calling run() and shutting down
        // from inside dispatch() on the first (and only) real request.
        server.transport.dispatched.lock().unwrap().clear();
        let server = std::sync::Arc::new(server);
        let runner = std::sync::Arc::clone(&server);
        let handle = std::thread::spawn(move || runner.run());

        for _ in 0..50 {
            if !server.transport.dispatched.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        server.shutdown();
        handle.join().unwrap();

        assert_eq!(*server.transport.dispatched.lock().unwrap(), vec![200]);
        let replies = server.transport.replies_seen.lock().unwrap();
        // first call: no prior reply target; second call: the handle just dispatched
        assert_eq!(replies[0].0, None);
        assert_eq!(replies[1].0, Some(200));
    }

    #[test]
    fn accept_does_not_set_a_reply_target() {
        let transport = ScriptedTransport {
            outcomes: StdMutex::new(vec![
                ReceiveOutcome::Timeout,
                ReceiveOutcome::Accept { signaled_index: 0 },
            ]),
            replies_seen: StdMutex::new(Vec::new()),
            dispatched: StdMutex::new(Vec::new()),
            accepted: StdMutex::new(Vec::new()),
        };
        let handles = HandleSet::new();
        handles.set_ports(&[100], &[200]);
        let server = std::sync::Arc::new(ServerLoop::new(transport, handles));
        let runner = std::sync::Arc::clone(&server);
        let handle = std::thread::spawn(move || runner.run());

        for _ in 0..50 {
            if !server.transport.accepted.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        server.shutdown();
        handle.join().unwrap();

        assert_eq!(*server.transport.accepted.lock().unwrap(), vec![100]);
        let replies = server.transport.replies_seen.lock().unwrap();
        assert!(replies.iter().all(|(target, _)| target.is_none()));
    }
}
