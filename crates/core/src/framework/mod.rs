//! Boundary to the external media framework.
//!
//! The controller only needs a handful of operations from the framework:
//! building a pipeline from a textual description, locating a stage by name,
//! receiving "buffer ready" notifications from that stage, switching the
//! pipeline between playing and idle, and watching its message bus. Anything
//! implementing [`MediaFramework`] can be hosted; [`synthetic`] provides an
//! in-process implementation.

pub mod synthetic;

use std::sync::{Arc, OnceLock};

use crate::FrameworkError;

/// State the controller may request from a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Playing,
    Idle,
}

/// Non-owning reference to a stage inside a pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageRef(usize);

impl StageRef {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Asynchronous notification posted on a pipeline's bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    EndOfStream,
    Error {
        message: String,
        debug: Option<String>,
    },
    Warning {
        message: String,
    },
    StateChanged {
        from: TargetState,
        to: TargetState,
    },
    StreamStart,
}

/// Why a stage refused to keep streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// The consumer went away; stop quietly.
    Flushing,
    /// Streaming failed; the framework reports this on the bus.
    Error,
}

pub type FlowResult = std::result::Result<(), FlowError>;

/// Access to the buffer a stage has ready, only valid inside a
/// [`BufferReadyHandler`] invocation.
pub trait PullBuffer {
    /// Returns the next buffer. The slice borrows framework memory and cannot
    /// be retained past the handler call.
    fn pull_next_buffer(&mut self) -> Option<&[u8]>;
}

pub type BufferReadyHandler = Arc<dyn Fn(&mut dyn PullBuffer) -> FlowResult + Send + Sync>;
pub type BusHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

pub trait MediaFramework: Send + Sync {
    fn name(&self) -> &str;

    /// Process-wide initialisation. Called at most once per process through
    /// [`ensure_initialized`].
    fn init(&self) -> Result<(), FrameworkError> {
        Ok(())
    }

    fn build(&self, description: &str) -> Result<Box<dyn Pipeline>, FrameworkError>;
}

/// A configured pipeline graph. Handlers may be invoked on framework-owned
/// threads.
pub trait Pipeline: Send {
    fn find_stage(&self, name: &str) -> Option<StageRef>;

    fn connect_buffer_ready(
        &mut self,
        stage: StageRef,
        handler: BufferReadyHandler,
    ) -> Result<(), FrameworkError>;

    fn add_bus_watch(&mut self, handler: BusHandler);

    fn remove_bus_watch(&mut self);

    /// Redundant transitions must be no-ops.
    fn set_state(&mut self, state: TargetState) -> Result<(), FrameworkError>;
}

/// Owned pipeline. Dropping it unsubscribes the bus watch and forces the
/// pipeline to [`TargetState::Idle`].
pub struct PipelineHandle {
    inner: Box<dyn Pipeline>,
}

impl PipelineHandle {
    pub fn new(inner: Box<dyn Pipeline>) -> Self {
        Self { inner }
    }

    pub fn find_stage(&self, name: &str) -> Option<StageRef> {
        self.inner.find_stage(name)
    }

    pub fn connect_buffer_ready(
        &mut self,
        stage: StageRef,
        handler: BufferReadyHandler,
    ) -> Result<(), FrameworkError> {
        self.inner.connect_buffer_ready(stage, handler)
    }

    pub fn add_bus_watch(&mut self, handler: BusHandler) {
        self.inner.add_bus_watch(handler);
    }

    pub fn set_state(&mut self, state: TargetState) -> Result<(), FrameworkError> {
        self.inner.set_state(state)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.inner.remove_bus_watch();
        if let Err(err) = self.inner.set_state(TargetState::Idle) {
            tracing::warn!(%err, "failed to idle pipeline during release");
        }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle").finish()
    }
}

static INIT: OnceLock<Result<(), FrameworkError>> = OnceLock::new();

/// Runs the framework's process-wide initialisation exactly once. Later calls,
/// from any thread, observe the first outcome.
pub fn ensure_initialized(framework: &dyn MediaFramework) -> Result<(), FrameworkError> {
    INIT.get_or_init(|| {
        tracing::info!(framework = framework.name(), "initialising media framework");
        framework.init()
    })
    .clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Probe {
        states: Arc<Mutex<Vec<TargetState>>>,
        watch_removed: Arc<AtomicUsize>,
    }

    impl Pipeline for Probe {
        fn find_stage(&self, _name: &str) -> Option<StageRef> {
            None
        }

        fn connect_buffer_ready(
            &mut self,
            stage: StageRef,
            _handler: BufferReadyHandler,
        ) -> Result<(), FrameworkError> {
            Err(FrameworkError::UnknownStage(stage.index()))
        }

        fn add_bus_watch(&mut self, _handler: BusHandler) {}

        fn remove_bus_watch(&mut self) {
            self.watch_removed.fetch_add(1, Ordering::SeqCst);
        }

        fn set_state(&mut self, state: TargetState) -> Result<(), FrameworkError> {
            self.states.lock().unwrap().push(state);
            Ok(())
        }
    }

    #[test]
    fn dropping_handle_releases_pipeline() {
        let probe = Probe::default();
        let states = probe.states.clone();
        let removed = probe.watch_removed.clone();

        let mut handle = PipelineHandle::new(Box::new(probe));
        handle.set_state(TargetState::Playing).unwrap();
        drop(handle);

        assert_eq!(
            *states.lock().unwrap(),
            vec![TargetState::Playing, TargetState::Idle]
        );
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    struct Counting(Arc<AtomicUsize>);

    impl MediaFramework for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn init(&self) -> Result<(), FrameworkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn build(&self, _description: &str) -> Result<Box<dyn Pipeline>, FrameworkError> {
            Ok(Box::new(Probe::default()))
        }
    }

    #[test]
    fn initialisation_runs_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let framework = Arc::new(Counting(calls.clone()));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let framework = framework.clone();
                std::thread::spawn(move || ensure_initialized(&*framework))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        ensure_initialized(&*framework).unwrap();

        // Another framework may have won the process-wide race in a parallel test.
        assert!(calls.load(Ordering::SeqCst) <= 1);
    }
}
