use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::CallbackBridge;
use crate::bus::{BusEvent, BusEventSink, BusListener};
use crate::framework::{
    ensure_initialized, BufferReadyHandler, FlowError, MediaFramework, PipelineHandle, PullBuffer,
    StageRef, TargetState,
};
use crate::{
    BridgeError, ConfigError, ControllerConfig, FrameBuffer, FramePipeError, Result, RuntimeFault,
    StateError,
};

/// Lifecycle state of a [`PipelineController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    Unconfigured,
    Configured,
    Playing,
    Stopped,
    Faulted,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Playing => "playing",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Published after every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ControllerState,
    pub current: ControllerState,
    /// Set when `current` is [`ControllerState::Faulted`].
    pub fault: Option<RuntimeFault>,
}

pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Session {
    pipeline: PipelineHandle,
    stage: StageRef,
    listener: BusListener,
}

struct ControllerInner {
    state: ControllerState,
    fault: Option<RuntimeFault>,
    session: Option<Session>,
}

impl ControllerInner {
    fn transition(
        &mut self,
        next: ControllerState,
        fault: Option<RuntimeFault>,
    ) -> Option<StateChange> {
        if self.state == next && self.fault == fault {
            return None;
        }

        let previous = self.state;
        self.state = next;
        self.fault = fault.clone();
        Some(StateChange {
            previous,
            current: next,
            fault,
        })
    }
}

/// State shared between the application-facing API and bus reactions running
/// on the dispatch thread. Every transition happens under `inner`.
struct ControllerShared {
    bridge: Arc<CallbackBridge>,
    inner: Mutex<ControllerInner>,
    // Bumped under `inner` by configure, start, stop and teardown. Bus events
    // stamped with an older epoch are stale.
    epoch: AtomicU64,
    changed: Condvar,
    observer: Mutex<Option<StateCallback>>,
}

impl ControllerShared {
    fn lock(&self) -> Result<MutexGuard<'_, ControllerInner>> {
        self.inner
            .lock()
            .map_err(|_| FramePipeError::msg("controller state has been poisoned"))
    }

    fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues `change` for the observer on the dispatch thread. Call with
    /// `inner` held so notifications keep transition order.
    fn publish(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };

        self.changed.notify_all();
        match &change.fault {
            Some(fault) => tracing::warn!(
                from = %change.previous,
                to = %change.current,
                %fault,
                "controller state changed"
            ),
            None => tracing::info!(
                from = %change.previous,
                to = %change.current,
                "controller state changed"
            ),
        }

        let Some(observer) = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        if !self.bridge.dispatcher().post(move || observer(&change)) {
            tracing::debug!("dispatch thread gone, dropping state notification");
        }
    }
}

impl BusEventSink for ControllerShared {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn handle_bus_event(&self, epoch: u64, event: BusEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if epoch != self.current_epoch() {
            tracing::debug!(epoch, ?event, "ignoring bus event from an earlier run");
            return;
        }
        let Some(session) = inner.session.as_mut() else {
            return;
        };

        // Release a producer that may still be waiting before idling.
        self.bridge.close_gate();
        if let Err(err) = session.pipeline.set_state(TargetState::Idle) {
            tracing::warn!(%err, "failed to idle pipeline after bus event");
        }

        let change = match event {
            BusEvent::EndOfStream => {
                tracing::info!(epoch, "end of stream");
                if inner.state == ControllerState::Playing {
                    inner.transition(ControllerState::Stopped, None)
                } else {
                    None
                }
            }
            BusEvent::Error(fault) => {
                tracing::error!(epoch, %fault, "pipeline error");
                match inner.state {
                    ControllerState::Configured | ControllerState::Playing => {
                        inner.transition(ControllerState::Faulted, Some(fault))
                    }
                    state => {
                        tracing::debug!(%state, "error outside an active state");
                        None
                    }
                }
            }
        };
        self.publish(change);
    }
}

/// Hosts one externally defined pipeline and delivers its output frames to a
/// registered callback.
///
/// Frame callbacks and state observers run on the controller's dispatch
/// thread, observers in the order the transitions happened. Dropping the
/// controller releases the pipeline and joins the dispatch thread, so a
/// running callback is allowed to finish first.
pub struct PipelineController {
    framework: Arc<dyn MediaFramework>,
    config: ControllerConfig,
    shared: Arc<ControllerShared>,
}

impl PipelineController {
    pub fn new(framework: Arc<dyn MediaFramework>) -> Result<Self> {
        Self::with_config(framework, ControllerConfig::default())
    }

    /// Creates a controller, initialising the framework on first use in this
    /// process.
    pub fn with_config(
        framework: Arc<dyn MediaFramework>,
        config: ControllerConfig,
    ) -> Result<Self> {
        ensure_initialized(framework.as_ref())?;
        let bridge = Arc::new(CallbackBridge::spawn(&config.dispatch_thread_name)?);

        Ok(Self {
            framework,
            config,
            shared: Arc::new(ControllerShared {
                bridge,
                inner: Mutex::new(ControllerInner {
                    state: ControllerState::Unconfigured,
                    fault: None,
                    session: None,
                }),
                epoch: AtomicU64::new(0),
                changed: Condvar::new(),
                observer: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Builds a pipeline from `description` and makes it current.
    ///
    /// On error the previous pipeline and state are left untouched. On
    /// success any previous pipeline is released abruptly, even while
    /// playing. The new pipeline is built while the previous one is still
    /// alive, so a source that needs exclusive access to a device may fail
    /// to build until the controller is stopped or reconfigured elsewhere.
    pub fn configure(&self, description: &str) -> Result<()> {
        let pipeline = self
            .framework
            .build(description)
            .map_err(|err| ConfigError::InvalidSpecification(err.to_string()))?;
        let mut pipeline = PipelineHandle::new(pipeline);

        let output_stage = &self.config.output_stage;
        let stage = pipeline
            .find_stage(output_stage)
            .ok_or_else(|| ConfigError::OutputStageMissing(output_stage.clone()))?;
        pipeline
            .connect_buffer_ready(stage, frame_handler(self.shared.bridge.clone()))
            .map_err(|err| {
                tracing::warn!(%err, stage = %output_stage, "output stage cannot deliver buffers");
                ConfigError::OutputStageMissing(output_stage.clone())
            })?;

        let mut inner = self.shared.lock()?;
        let epoch = self.shared.advance_epoch();
        self.shared.bridge.close_gate();
        if let Some(previous) = inner.session.take() {
            tracing::info!(
                attached_at = previous.listener.attached_at(),
                "releasing previous pipeline"
            );
            drop(previous);
        }

        let weak = Arc::downgrade(&self.shared);
        let sink: Weak<dyn BusEventSink> = weak;
        let listener =
            BusListener::attach(&mut pipeline, self.shared.bridge.dispatcher(), sink);
        tracing::info!(
            epoch,
            stage = %output_stage,
            index = stage.index(),
            "pipeline configured"
        );

        inner.session = Some(Session {
            pipeline,
            stage,
            listener,
        });
        let change = inner.transition(ControllerState::Configured, None);
        self.shared.publish(change);
        Ok(())
    }

    /// Replaces the frame callback. Allowed in any state.
    pub fn register_frame_callback<F>(&self, callback: F)
    where
        F: Fn(FrameBuffer) + Send + Sync + 'static,
    {
        self.shared.bridge.register(Arc::new(callback));
    }

    /// Subscribes to state transitions, including asynchronous faults.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Asks the pipeline to play. A no-op while already playing.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.lock()?;
        let state = inner.state;
        let Some(session) = inner.session.as_mut() else {
            return Err(StateError::NotConfigured.into());
        };
        if state == ControllerState::Playing {
            tracing::debug!("start requested while already playing");
            return Ok(());
        }
        if !self.shared.bridge.has_callback() {
            tracing::warn!("starting without a frame callback, frames will be dropped");
        }

        let epoch = self.shared.advance_epoch();
        self.shared.bridge.open_gate();
        if let Err(err) = session.pipeline.set_state(TargetState::Playing) {
            self.shared.bridge.close_gate();
            return Err(err.into());
        }
        tracing::info!(epoch, stage = session.stage.index(), "pipeline playing");

        let change = inner.transition(ControllerState::Playing, None);
        self.shared.publish(change);
        Ok(())
    }

    /// Asks the pipeline to go idle. Repeated calls are harmless; a faulted
    /// controller stays faulted.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.shared.lock()?;
        let state = inner.state;
        let Some(session) = inner.session.as_mut() else {
            return Err(StateError::NotConfigured.into());
        };

        self.shared.advance_epoch();
        self.shared.bridge.close_gate();
        session.pipeline.set_state(TargetState::Idle)?;

        let change = match state {
            ControllerState::Playing | ControllerState::Configured => {
                inner.transition(ControllerState::Stopped, None)
            }
            _ => None,
        };
        self.shared.publish(change);
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Diagnostic attached to the last transition into
    /// [`ControllerState::Faulted`].
    pub fn fault(&self) -> Option<RuntimeFault> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fault
            .clone()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.shared.bridge.frames_delivered()
    }

    /// Last frame handed to the callback. It survives stop and end-of-stream
    /// and is replaced by the next delivered frame.
    pub fn current_frame(&self) -> Option<FrameBuffer> {
        self.shared.bridge.latest_frame()
    }

    /// Blocks until the controller is in one of `targets` or `timeout`
    /// elapses. Returns the matching state.
    pub fn wait_for_state(
        &self,
        targets: &[ControllerState],
        timeout: Duration,
    ) -> Option<ControllerState> {
        let inner = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (inner, _) = self
            .shared
            .changed
            .wait_timeout_while(inner, timeout, |inner| !targets.contains(&inner.state))
            .unwrap_or_else(PoisonError::into_inner);

        targets.contains(&inner.state).then_some(inner.state)
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.shared.bridge.close_gate();
        let session = {
            let mut inner = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.advance_epoch();
            inner.session.take()
        };
        drop(session);

        self.shared.bridge.shutdown();
        self.shared.bridge.clear_callback();
        self.shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("pipeline controller released");
    }
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("framework", &self.framework.name())
            .field("output_stage", &self.config.output_stage)
            .field("state", &self.state())
            .finish()
    }
}

/// Runs on the framework's streaming thread for every buffer the output stage
/// has ready.
fn frame_handler(bridge: Arc<CallbackBridge>) -> BufferReadyHandler {
    Arc::new(move |pull: &mut dyn PullBuffer| {
        let Some(data) = pull.pull_next_buffer() else {
            tracing::warn!("buffer-ready notification without a buffer");
            return Err(FlowError::Error);
        };
        let frame = FrameBuffer::copy_from_slice(data);

        match bridge.submit(frame) {
            Ok(()) => Ok(()),
            Err(BridgeError::NoCallbackRegistered) => {
                tracing::warn!("no frame callback registered, dropping frame");
                Ok(())
            }
            Err(BridgeError::ConsumerUnavailable) => Err(FlowError::Flushing),
        }
    })
}
