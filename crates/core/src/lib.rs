//! Core library for framepipe.
//!
//! A [`PipelineController`] hosts a pipeline built by an external
//! [`MediaFramework`] from a textual description, drives its lifecycle and
//! hands every buffer produced by the pipeline's output stage to an
//! application callback, one frame at a time. Bus errors and end-of-stream are
//! turned into controller state transitions rather than errors thrown across
//! threads.

pub mod bridge;
mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod framework;

pub use bridge::{CallbackBridge, FrameCallback};
pub use config::{AppConfig, ControllerConfig, DEFAULT_OUTPUT_STAGE};
pub use controller::{ControllerState, PipelineController, StateCallback, StateChange};
pub use error::{
    BridgeError, ConfigError, FramePipeError, FrameworkError, Result, RuntimeFault, StateError,
};
pub use frame::FrameBuffer;
pub use framework::synthetic::SyntheticFramework;
pub use framework::{MediaFramework, Pipeline, PipelineHandle, TargetState};
