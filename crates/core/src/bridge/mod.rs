//! Hand-off of frames from pipeline threads to the application context.
//!
//! The application context is a dedicated dispatch thread. Frames and
//! serialized controller work (bus reactions) travel through one FIFO queue,
//! so a task posted after a frame only runs once that frame's callback has
//! returned.
//!
//! [`CallbackBridge::submit`] waits until the dispatch thread has taken its
//! frame off the queue. With a single producer this keeps at most one frame
//! in flight: the next `submit` cannot be accepted before the previous
//! callback finishes. Waiting producers are released with
//! [`BridgeError::ConsumerUnavailable`] when the gate closes or the dispatch
//! thread shuts down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{BridgeError, FrameBuffer, Result};

/// Application-supplied frame handler.
pub type FrameCallback = Arc<dyn Fn(FrameBuffer) + Send + Sync>;

type Task = Box<dyn FnOnce() + Send>;

enum Dispatch {
    Frame {
        frame: FrameBuffer,
        // Zero capacity: the send only succeeds if the producer is still waiting.
        accepted: Sender<()>,
    },
    Task(Task),
    Shutdown,
}

/// Posts work onto the dispatch thread, behind any frames already queued.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: Sender<Dispatch>,
}

impl Dispatcher {
    /// Returns `false` once the dispatch thread is gone.
    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Dispatch::Task(Box::new(task))).is_ok()
    }
}

/// Open while the pipeline may stream. Dropping `_open` disconnects `closed`,
/// which wakes every producer waiting on it.
struct Gate {
    _open: Sender<()>,
    closed: Receiver<()>,
}

#[derive(Default)]
struct Slots {
    callback: Mutex<Option<FrameCallback>>,
    latest: Mutex<Option<FrameBuffer>>,
    delivered: AtomicU64,
}

impl Slots {
    fn callback(&self) -> Option<FrameCallback> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, callback: Option<FrameCallback>, frame: FrameBuffer) {
        let Some(callback) = callback else {
            tracing::warn!(len = frame.len(), "dropping frame, callback was released");
            return;
        };

        let len = frame.len();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(len, "frame delivered");
            }
            Err(_) => tracing::error!(len, "frame callback panicked"),
        }
    }
}

pub struct CallbackBridge {
    slots: Arc<Slots>,
    gate: Mutex<Option<Gate>>,
    tx: Sender<Dispatch>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackBridge {
    /// Starts the dispatch thread.
    pub fn spawn(thread_name: &str) -> Result<Self> {
        let slots = Arc::new(Slots::default());
        let (tx, rx) = crossbeam_channel::unbounded();

        let worker = {
            let slots = slots.clone();
            thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || dispatch_loop(rx, slots))?
        };

        Ok(Self {
            slots,
            gate: Mutex::new(None),
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Replaces the registered callback. A frame already being dispatched
    /// keeps the callback it started with.
    pub fn register(&self, callback: FrameCallback) {
        *self
            .slots
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn clear_callback(&self) {
        self.slots
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn has_callback(&self) -> bool {
        self.slots.callback().is_some()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.slots.delivered.load(Ordering::SeqCst)
    }

    /// Most recent frame handed to the callback, kept after the stream ends.
    pub fn latest_frame(&self) -> Option<FrameBuffer> {
        self.slots
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Allows submissions until the next [`close_gate`](Self::close_gate).
    pub fn open_gate(&self) {
        let (open, closed) = crossbeam_channel::bounded(0);
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Gate {
            _open: open,
            closed,
        });
    }

    /// Rejects new submissions and releases producers blocked in `submit`.
    pub fn close_gate(&self) {
        if self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            tracing::debug!("frame gate closed");
        }
    }

    /// Hands `frame` to the application context, blocking the calling
    /// (producer) thread until the dispatch thread accepts it.
    pub fn submit(&self, frame: FrameBuffer) -> std::result::Result<(), BridgeError> {
        if !self.has_callback() {
            return Err(BridgeError::NoCallbackRegistered);
        }

        let closed = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|gate| gate.closed.clone())
            .ok_or(BridgeError::ConsumerUnavailable)?;

        let (accepted_tx, accepted_rx) = crossbeam_channel::bounded(0);
        self.tx
            .send(Dispatch::Frame {
                frame,
                accepted: accepted_tx,
            })
            .map_err(|_| BridgeError::ConsumerUnavailable)?;

        select! {
            recv(accepted_rx) -> accepted => accepted.map_err(|_| BridgeError::ConsumerUnavailable),
            recv(closed) -> _ => Err(BridgeError::ConsumerUnavailable),
        }
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            tx: self.tx.clone(),
        }
    }

    /// Closes the gate and stops the dispatch thread once the work already
    /// queued has drained. Queued frames are not delivered: their producers
    /// were released with [`BridgeError::ConsumerUnavailable`]. Does not join
    /// when called from the dispatch thread itself.
    pub fn shutdown(&self) {
        self.close_gate();
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let _ = self.tx.send(Dispatch::Shutdown);
        if worker.thread().id() == thread::current().id() {
            tracing::debug!("shutdown requested from dispatch thread, detaching");
            return;
        }
        if worker.join().is_err() {
            tracing::error!("dispatch thread panicked");
        }
    }
}

impl Drop for CallbackBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CallbackBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBridge")
            .field("has_callback", &self.has_callback())
            .field("frames_delivered", &self.frames_delivered())
            .finish()
    }
}

fn dispatch_loop(rx: Receiver<Dispatch>, slots: Arc<Slots>) {
    for dispatch in rx.iter() {
        match dispatch {
            Dispatch::Frame { frame, accepted } => {
                // Taken before the hand-off completes so a frame is bound to the
                // callback that was registered when it was accepted.
                let callback = slots.callback();
                if accepted.send(()).is_err() {
                    tracing::debug!(len = frame.len(), "producer gave up, dropping frame");
                    continue;
                }
                slots.deliver(callback, frame);
            }
            Dispatch::Task(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("dispatched task panicked");
                }
            }
            Dispatch::Shutdown => break,
        }
    }
    tracing::debug!("dispatch thread exiting");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn open_bridge() -> Arc<CallbackBridge> {
        let bridge = Arc::new(CallbackBridge::spawn("bridge-test").unwrap());
        bridge.open_gate();
        bridge
    }

    #[test]
    fn refuses_without_callback() {
        let bridge = open_bridge();
        let err = bridge.submit(FrameBuffer::from(vec![1])).unwrap_err();
        assert_eq!(err, BridgeError::NoCallbackRegistered);
    }

    #[test]
    fn refuses_while_gate_closed() {
        let bridge = Arc::new(CallbackBridge::spawn("bridge-test").unwrap());
        bridge.register(Arc::new(|_: FrameBuffer| {}));
        assert_eq!(
            bridge.submit(FrameBuffer::from(vec![1])),
            Err(BridgeError::ConsumerUnavailable)
        );

        bridge.open_gate();
        assert_eq!(bridge.submit(FrameBuffer::from(vec![1])), Ok(()));
        bridge.close_gate();
        assert_eq!(
            bridge.submit(FrameBuffer::from(vec![1])),
            Err(BridgeError::ConsumerUnavailable)
        );
    }

    #[test]
    fn delivers_in_submission_order() {
        let bridge = open_bridge();
        let (tx, rx) = crossbeam_channel::unbounded();
        bridge.register(Arc::new(move |frame: FrameBuffer| {
            tx.send(frame.as_slice().to_vec()).unwrap();
        }));

        let producer = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for n in 1..=3_u8 {
                    bridge.submit(FrameBuffer::from(vec![n; n as usize])).unwrap();
                }
            })
        };
        producer.join().unwrap();

        let received: Vec<Vec<u8>> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![vec![1], vec![2, 2], vec![3, 3, 3]]);
    }

    #[test]
    fn slow_callback_throttles_producer() {
        let delay = Duration::from_millis(150);
        let bridge = open_bridge();
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        bridge.register(Arc::new(move |_frame: FrameBuffer| {
            started_tx.send(Instant::now()).unwrap();
            thread::sleep(delay);
        }));

        bridge.submit(FrameBuffer::from(vec![1])).unwrap();
        bridge.submit(FrameBuffer::from(vec![2])).unwrap();
        let second_returned = Instant::now();

        let first_started = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(second_returned >= first_started + delay);
    }

    #[test]
    fn shutdown_releases_blocked_producer() {
        let bridge = open_bridge();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        bridge.register(Arc::new(move |_frame: FrameBuffer| {
            let _ = entered_tx.try_send(());
            let _ = release_rx.recv();
        }));

        bridge.submit(FrameBuffer::from(vec![1])).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let producer = {
            let bridge = bridge.clone();
            thread::spawn(move || {
                result_tx.send(bridge.submit(FrameBuffer::from(vec![2]))).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(result_rx.try_recv().is_err(), "second submit should be blocked");

        let closer = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.shutdown())
        };
        let result = result_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(BridgeError::ConsumerUnavailable));

        drop(release_tx);
        closer.join().unwrap();
        producer.join().unwrap();
        assert_eq!(bridge.frames_delivered(), 1);
    }

    #[test]
    fn tasks_run_after_earlier_frames() {
        let bridge = open_bridge();
        let finished = Arc::new(AtomicU64::new(0));
        {
            let finished = finished.clone();
            bridge.register(Arc::new(move |_frame: FrameBuffer| {
                thread::sleep(Duration::from_millis(50));
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bridge.submit(FrameBuffer::from(vec![1])).unwrap();
        let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
        let observed = finished.clone();
        assert!(bridge.dispatcher().post(move || {
            seen_tx.send(observed.load(Ordering::SeqCst)).unwrap();
        }));

        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn survives_panicking_callback() {
        let bridge = open_bridge();
        bridge.register(Arc::new(|frame: FrameBuffer| {
            if frame.as_slice() == [0] {
                panic!("bad frame");
            }
        }));

        bridge.submit(FrameBuffer::from(vec![0])).unwrap();
        bridge.submit(FrameBuffer::from(vec![1])).unwrap();

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        bridge.dispatcher().post(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(bridge.frames_delivered(), 1);
    }

    #[test]
    fn replaced_callback_receives_later_frames() {
        let bridge = open_bridge();
        let (tx, rx) = crossbeam_channel::unbounded();
        let first = tx.clone();
        bridge.register(Arc::new(move |_frame: FrameBuffer| first.send("first").unwrap()));
        bridge.submit(FrameBuffer::from(vec![1])).unwrap();

        bridge.register(Arc::new(move |_frame: FrameBuffer| tx.send("second").unwrap()));
        bridge.submit(FrameBuffer::from(vec![2])).unwrap();

        let labels: Vec<&str> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(labels, vec!["first", "second"]);
    }

    #[test]
    fn keeps_latest_delivered_frame() {
        let bridge = open_bridge();
        assert_eq!(bridge.latest_frame(), None);
        bridge.register(Arc::new(|_frame: FrameBuffer| {}));

        bridge.submit(FrameBuffer::from(vec![1, 1])).unwrap();
        bridge.submit(FrameBuffer::from(vec![2])).unwrap();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        bridge.dispatcher().post(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(bridge.latest_frame(), Some(FrameBuffer::from(vec![2])));
    }
}
