use std::sync::{Arc, Weak};

use crate::bridge::Dispatcher;
use crate::framework::{BusMessage, PipelineHandle};
use crate::RuntimeFault;

/// Bus messages the controller reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BusEvent {
    EndOfStream,
    Error(RuntimeFault),
}

impl BusEvent {
    /// Everything except end-of-stream and errors is discarded.
    pub(crate) fn classify(message: BusMessage) -> Option<Self> {
        match message {
            BusMessage::EndOfStream => Some(Self::EndOfStream),
            BusMessage::Error { message, debug } => {
                Some(Self::Error(RuntimeFault { message, debug }))
            }
            BusMessage::Warning { message } => {
                tracing::warn!(%message, "pipeline warning");
                None
            }
            other => {
                tracing::trace!(?other, "ignoring bus message");
                None
            }
        }
    }
}

/// Receives classified bus events on the dispatch thread.
pub(crate) trait BusEventSink: Send + Sync {
    /// Run epoch at the moment a message is emitted. Must not block: it is
    /// read on framework threads.
    fn current_epoch(&self) -> u64;

    fn handle_bus_event(&self, epoch: u64, event: BusEvent);
}

/// Subscription to one pipeline's bus. It lives exactly as long as the
/// [`PipelineHandle`] it was attached to; releasing the handle removes the
/// watch.
#[derive(Debug)]
pub(crate) struct BusListener {
    attached_at: u64,
}

impl BusListener {
    /// Events are stamped with the sink's epoch when emitted and queued behind
    /// any frames already handed to the dispatch thread.
    pub(crate) fn attach(
        pipeline: &mut PipelineHandle,
        dispatcher: Dispatcher,
        sink: Weak<dyn BusEventSink>,
    ) -> Self {
        let attached_at = sink.upgrade().map_or(0, |sink| sink.current_epoch());

        pipeline.add_bus_watch(Arc::new(move |message: BusMessage| {
            let Some(event) = BusEvent::classify(message) else {
                return;
            };
            let Some(epoch) = sink.upgrade().map(|sink| sink.current_epoch()) else {
                return;
            };

            let sink = sink.clone();
            let posted = dispatcher.post(move || {
                if let Some(sink) = sink.upgrade() {
                    sink.handle_bus_event(epoch, event);
                }
            });
            if !posted {
                tracing::debug!(epoch, "dispatch thread gone, dropping bus event");
            }
        }));

        tracing::debug!(epoch = attached_at, "bus listener attached");
        Self { attached_at }
    }

    /// Epoch of the controller when the listener was attached.
    pub(crate) fn attached_at(&self) -> u64 {
        self.attached_at
    }
}
