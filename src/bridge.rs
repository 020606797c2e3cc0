//! Request queue and bus dispatch loop.
//!
//! The bridge is the single choke point between all producers (client
//! sessions, the cyclic scheduler) and the one consumer (the engine).
//! Requests are FIFO within their priority class; client requests are
//! served ahead of poll requests so interactive queries are not starved
//! by background polling. The queue is bounded per class and fails fast
//! with `Busy` when full.

use crate::config::BusTimings;
use crate::engine::{BusEngine, Transaction};
use crate::error::BusError;
use crate::frame::Payload;
use crate::registry::{CommandDefinition, ReplyValues};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Outcome of one transaction, as routed back to the requester.
pub type TransactionResult = Result<ReplyValues, BusError>;

/// Who produced a request; doubles as its priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestOrigin {
    Client,
    Poll,
}

/// One queued request. Lives only inside the queue; the responder is the
/// sole route back to the originating session or poll continuation.
#[derive(Debug)]
pub struct PendingRequest {
    pub origin: RequestOrigin,
    pub def: Arc<CommandDefinition>,
    pub payload: Payload,
    pub responder: oneshot::Sender<TransactionResult>,
}

#[derive(Debug)]
struct QueueInner {
    client: VecDeque<PendingRequest>,
    poll: VecDeque<PendingRequest>,
    closed: bool,
    engine_down: bool,
}

/// Bounded two-class FIFO queue. The sole shared mutable structure with
/// concurrent producers; a single mutex keeps enqueue/dequeue atomic.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                client: VecDeque::new(),
                poll: VecDeque::new(),
                closed: false,
                engine_down: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Creates the completion channel and enqueues a request. Returns the
    /// receiver immediately; rejection (`Busy`, `EngineDown`) is
    /// synchronous and no bus activity happens for rejected requests.
    pub fn enqueue(
        &self,
        origin: RequestOrigin,
        def: Arc<CommandDefinition>,
        payload: Payload,
    ) -> Result<oneshot::Receiver<TransactionResult>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.submit(PendingRequest {
            origin,
            def,
            payload,
            responder: tx,
        })?;
        Ok(rx)
    }

    /// Enqueues a prepared request, failing fast when the class queue is
    /// at capacity or the engine is gone. On rejection the error is also
    /// sent through the responder so awaiting callers always complete.
    pub fn submit(&self, request: PendingRequest) -> Result<(), BusError> {
        let mut inner = self.inner.lock().unwrap();
        let rejection = if inner.engine_down || inner.closed {
            Some(BusError::EngineDown)
        } else {
            let depth = match request.origin {
                RequestOrigin::Client => inner.client.len(),
                RequestOrigin::Poll => inner.poll.len(),
            };
            if depth >= self.capacity {
                Some(BusError::Busy)
            } else {
                None
            }
        };

        if let Some(err) = rejection {
            drop(inner);
            debug!(origin = ?request.origin, error = %err, "request rejected at submission");
            let _ = request.responder.send(Err(err.clone()));
            return Err(err);
        }

        match request.origin {
            RequestOrigin::Client => inner.client.push_back(request),
            RequestOrigin::Poll => inner.poll.push_back(request),
        }
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a request is available or the queue is closed and
    /// drained. Client requests always dequeue first.
    fn next_request(&self) -> Option<PendingRequest> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let request = match inner.client.pop_front() {
                Some(r) => Some(r),
                None => inner.poll.pop_front(),
            };
            if let Some(request) = request {
                return Some(request);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Wakes the dispatch loop for shutdown; queued requests still drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.available.notify_all();
    }

    /// Fails every queued request and all future submissions. Called by
    /// the dispatch loop after a device fault.
    fn fail_all(&self) {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.inner.lock().unwrap();
            inner.engine_down = true;
            let mut drained: Vec<PendingRequest> = inner.client.drain(..).collect();
            drained.extend(inner.poll.drain(..));
            drained
        };
        for request in drained {
            let _ = request.responder.send(Err(BusError::EngineDown));
        }
    }

    /// Queue depths `(client, poll)`, for status queries.
    pub fn depths(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.client.len(), inner.poll.len())
    }
}

/// Owns the engine and drains the queue, one transaction at a time.
/// Sole caller of `BusEngine::execute`, by construction.
pub struct Bridge {
    queue: Arc<RequestQueue>,
    engine: BusEngine,
    address: u8,
    timings: BusTimings,
}

impl Bridge {
    pub fn new(
        engine: BusEngine,
        queue: Arc<RequestQueue>,
        address: u8,
        timings: BusTimings,
    ) -> Self {
        Self {
            queue,
            engine,
            address,
            timings,
        }
    }

    /// Runs the dispatch loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("bus-dispatch".to_string())
            .spawn(move || self.run())
    }

    /// Dispatch loop: dequeue, execute, route the result back. Exits when
    /// the queue closes or the engine reports a device fault.
    pub fn run(mut self) {
        info!("bus dispatch loop started");
        while let Some(request) = self.queue.next_request() {
            // Requester disconnected while queued: drop without sending
            if request.responder.is_closed() {
                debug!(command = %request.def.name, "requester gone, discarding queued request");
                continue;
            }

            let txn = Transaction::build(
                request.def,
                self.address,
                request.payload,
                &self.timings,
            );
            let result = self.engine.execute(&txn);
            let fatal = matches!(result, Err(BusError::DeviceFault(_)));

            // Requester may have gone away mid-transaction; the result is
            // simply discarded then
            let _ = request.responder.send(result);

            if fatal {
                error!("engine terminated on device fault, failing all pending requests");
                self.queue.fail_all();
                break;
            }
        }
        info!("bus dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testutil::numeric_read;
    use crate::registry::Value;
    use crate::transport::{MockExchange, MockTransport};

    fn fast_timings() -> BusTimings {
        BusTimings {
            quiet_ms: 1,
            recovery_ms: 0,
            echo_timeout_ms: 1,
            reply_timeout_ms: 5,
            send_retries: 2,
        }
    }

    fn bridge_with(script: Vec<MockExchange>, capacity: usize) -> (Arc<RequestQueue>, Bridge, MockTransport) {
        let mock = MockTransport::new(script);
        let engine = BusEngine::new(Box::new(mock.clone()), fast_timings());
        let queue = RequestQueue::new(capacity);
        let bridge = Bridge::new(engine, Arc::clone(&queue), 0xFF, fast_timings());
        (queue, bridge, mock)
    }

    fn value_of(result: TransactionResult) -> f64 {
        match result.unwrap().remove(0).1 {
            Value::Number(n) => n,
            other => panic!("expected number, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order_within_class() {
        let (queue, bridge, _mock) = bridge_with(
            vec![
                MockExchange::reply(&[10, 0]),
                MockExchange::reply(&[20, 0]),
                MockExchange::reply(&[30, 0]),
            ],
            8,
        );
        let def = Arc::new(numeric_read("OUTSIDE_TEMP", 1.0, 0));

        let r1 = queue.enqueue(RequestOrigin::Client, def.clone(), Payload::new()).unwrap();
        let r2 = queue.enqueue(RequestOrigin::Client, def.clone(), Payload::new()).unwrap();
        let r3 = queue.enqueue(RequestOrigin::Client, def, Payload::new()).unwrap();

        let handle = bridge.spawn().unwrap();
        assert_eq!(value_of(r1.blocking_recv().unwrap()), 10.0);
        assert_eq!(value_of(r2.blocking_recv().unwrap()), 20.0);
        assert_eq!(value_of(r3.blocking_recv().unwrap()), 30.0);

        queue.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_client_served_before_queued_poll() {
        let (queue, bridge, _mock) = bridge_with(
            vec![
                MockExchange::reply(&[1, 0]),
                MockExchange::reply(&[2, 0]),
            ],
            8,
        );
        let def = Arc::new(numeric_read("OUTSIDE_TEMP", 1.0, 0));

        // Poll submitted first, but the client must reach the bus first
        let poll_rx = queue.enqueue(RequestOrigin::Poll, def.clone(), Payload::new()).unwrap();
        let client_rx = queue.enqueue(RequestOrigin::Client, def, Payload::new()).unwrap();

        let handle = bridge.spawn().unwrap();
        assert_eq!(value_of(client_rx.blocking_recv().unwrap()), 1.0);
        assert_eq!(value_of(poll_rx.blocking_recv().unwrap()), 2.0);

        queue.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_busy_when_full_with_zero_bus_activity() {
        let (queue, _bridge, mock) = bridge_with(vec![], 1);
        let def = Arc::new(numeric_read("OUTSIDE_TEMP", 1.0, 0));

        queue.enqueue(RequestOrigin::Client, def.clone(), Payload::new()).unwrap();
        let mut second = queue
            .enqueue(RequestOrigin::Client, def.clone(), Payload::new());
        assert!(matches!(second, Err(BusError::Busy)));

        // Classes are bounded independently
        second = queue.enqueue(RequestOrigin::Poll, def, Payload::new());
        assert!(second.is_ok());

        // No dispatcher ran, nothing may have touched the transport
        assert!(mock.sent().is_empty());
        assert_eq!(mock.attempts(), 0);
    }

    #[test]
    fn test_disconnected_requester_skipped_without_bus_activity() {
        let (queue, bridge, mock) = bridge_with(vec![MockExchange::reply(&[7, 0])], 8);
        let def = Arc::new(numeric_read("OUTSIDE_TEMP", 1.0, 0));

        let dead_rx = queue
            .enqueue(RequestOrigin::Client, def.clone(), Payload::new())
            .unwrap();
        drop(dead_rx);
        let live_rx = queue.enqueue(RequestOrigin::Client, def, Payload::new()).unwrap();

        let handle = bridge.spawn().unwrap();
        assert_eq!(value_of(live_rx.blocking_recv().unwrap()), 7.0);
        // Only the live request consumed a bus transaction
        assert_eq!(mock.attempts(), 1);

        queue.close();
        handle.join().unwrap();
    }

    #[test]
    fn test_device_fault_fails_pending_and_future_requests() {
        let (queue, bridge, _mock) = bridge_with(vec![MockExchange::fault()], 8);
        let def = Arc::new(numeric_read("OUTSIDE_TEMP", 1.0, 0));

        let first = queue.enqueue(RequestOrigin::Client, def.clone(), Payload::new()).unwrap();
        let second = queue.enqueue(RequestOrigin::Client, def.clone(), Payload::new()).unwrap();

        let handle = bridge.spawn().unwrap();
        assert!(matches!(
            first.blocking_recv().unwrap(),
            Err(BusError::DeviceFault(_))
        ));
        assert_eq!(second.blocking_recv().unwrap(), Err(BusError::EngineDown));
        handle.join().unwrap();

        // Engine is gone: future submissions are rejected synchronously
        let result = queue.enqueue(RequestOrigin::Client, def, Payload::new());
        assert!(matches!(result, Err(BusError::EngineDown)));
    }
}
