use crate::recorder::Recorder;
use crate::state::Mode;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::thread;

/// A UI-triggered recording operation. Ownership passes to the single worker
/// on dequeue; there is no other consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Start { device: String, mode: Mode },
    Stop,
}

/// Bounded so a wedged worker caps memory in a long-running appliance
/// instead of queueing touch events forever.
pub const QUEUE_CAPACITY: usize = 32;

/// Producer half handed to the UI layer. Enqueueing never blocks: a full
/// queue drops the request and logs.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: Sender<Request>,
}

impl RequestQueue {
    pub fn enqueue(&self, request: Request) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                tracing::warn!(?request, "request queue full, dropping");
                false
            }
            Err(TrySendError::Disconnected(request)) => {
                tracing::error!(?request, "recording worker is gone, dropping");
                false
            }
        }
    }
}

pub fn request_channel() -> (RequestQueue, Receiver<Request>) {
    request_channel_with_capacity(QUEUE_CAPACITY)
}

pub fn request_channel_with_capacity(capacity: usize) -> (RequestQueue, Receiver<Request>) {
    let (tx, rx) = bounded(capacity);
    (RequestQueue { tx }, rx)
}

/// Single consumer draining the queue in strict FIFO order. Process spawn and
/// signal-and-wait latency lands here, never on the input-handling thread.
/// The thread exits once every `RequestQueue` clone is dropped.
pub fn spawn_worker(recorder: Arc<Recorder>, rx: Receiver<Request>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for request in rx {
            match request {
                Request::Start { device, mode } => {
                    let started = recorder.start(&device, mode);
                    tracing::debug!(device = %device, %mode, started, "start request handled");
                }
                Request::Stop => {
                    let outcome = recorder.stop();
                    tracing::debug!(?outcome, "stop request handled");
                }
            }
        }
        tracing::debug!("recording worker exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_dequeue_in_fifo_order() {
        let (queue, rx) = request_channel();
        assert!(queue.enqueue(Request::Start {
            device: "plughw:1,0".to_string(),
            mode: Mode::Manual,
        }));
        assert!(queue.enqueue(Request::Stop));
        assert!(matches!(rx.recv().expect("first"), Request::Start { .. }));
        assert_eq!(rx.recv().expect("second"), Request::Stop);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (queue, rx) = request_channel_with_capacity(1);
        assert!(queue.enqueue(Request::Stop));
        assert!(!queue.enqueue(Request::Stop));
        drop(rx);
    }

    #[test]
    fn enqueue_after_worker_gone_reports_failure() {
        let (queue, rx) = request_channel();
        drop(rx);
        assert!(!queue.enqueue(Request::Stop));
    }
}
