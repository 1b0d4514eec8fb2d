//! In-process media framework producing deterministic buffers.
//!
//! Descriptions follow the familiar launch-line shape, for example
//! `testsrc sizes=100,200,50 ! queue ! appsink name=sink`. Buffer `n` is filled
//! with the byte `n as u8`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{
    BufferReadyHandler, BusHandler, BusMessage, FlowError, MediaFramework, Pipeline, PullBuffer,
    StageRef, TargetState,
};
use crate::FrameworkError;

const DEFAULT_BUFFER_SIZE: usize = 64;
const FILTERS: &[&str] = &["queue", "identity", "videoconvert"];
const SINK_PROPERTIES: &[&str] = &["emit-signals", "sync", "max-buffers", "drop"];

#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticFramework;

impl SyntheticFramework {
    pub fn new() -> Self {
        Self
    }
}

impl MediaFramework for SyntheticFramework {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn build(&self, description: &str) -> Result<Box<dyn Pipeline>, FrameworkError> {
        Ok(Box::new(SyntheticPipeline::parse(description)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SizePlan {
    Fixed { size: usize, count: Option<u64> },
    Explicit(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq)]
struct SourceSpec {
    sizes: SizePlan,
    interval: Duration,
    error_after: Option<u64>,
    error_message: String,
}

impl SourceSpec {
    fn size_of(&self, index: u64) -> Option<usize> {
        match &self.sizes {
            SizePlan::Fixed { size, count } => match count {
                Some(count) if index >= *count => None,
                _ => Some(*size),
            },
            SizePlan::Explicit(sizes) => usize::try_from(index)
                .ok()
                .and_then(|index| sizes.get(index).copied()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Source,
    Filter,
    Sink,
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    kind: ElementKind,
}

type BusSlot = Arc<Mutex<Option<BusHandler>>>;

struct Streaming {
    // Dropping the sender wakes the streaming thread.
    _stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct SyntheticPipeline {
    elements: Vec<Element>,
    source: SourceSpec,
    handler: Option<BufferReadyHandler>,
    bus: BusSlot,
    streaming: Option<Streaming>,
}

impl SyntheticPipeline {
    pub fn parse(description: &str) -> Result<Self, FrameworkError> {
        let segments = split_quoted(description, |c| c == '!', false)?;
        if segments.iter().all(|segment| segment.trim().is_empty()) {
            return Err(FrameworkError::Parse("empty pipeline description".into()));
        }

        let mut elements = Vec::with_capacity(segments.len());
        let mut names = HashSet::new();
        let mut source = None;
        let last = segments.len() - 1;

        for (index, segment) in segments.iter().enumerate() {
            let tokens = split_quoted(segment, char::is_whitespace, true)?;
            let mut tokens = tokens.into_iter().filter(|token| !token.is_empty());
            let factory = tokens.next().ok_or_else(|| {
                FrameworkError::Parse(format!("empty element at position {index}"))
            })?;
            let properties = tokens
                .map(|token| parse_property(&factory, &token))
                .collect::<Result<Vec<_>, _>>()?;

            let kind = match factory.as_str() {
                "testsrc" | "videotestsrc" if index == 0 => {
                    source = Some(parse_source(&properties)?);
                    ElementKind::Source
                }
                "testsrc" | "videotestsrc" => {
                    return Err(FrameworkError::Parse(format!(
                        "{factory} has no sink pad and must start the pipeline"
                    )))
                }
                "appsink" if index == last => {
                    check_properties(&factory, &properties, SINK_PROPERTIES)?;
                    ElementKind::Sink
                }
                "appsink" => {
                    return Err(FrameworkError::Parse(
                        "appsink has no source pad and must end the pipeline".into(),
                    ))
                }
                caps if caps.contains('/') => ElementKind::Filter,
                filter if FILTERS.contains(&filter) => {
                    check_properties(&factory, &properties, &[])?;
                    ElementKind::Filter
                }
                other => return Err(FrameworkError::Parse(format!("no element \"{other}\""))),
            };

            let name = properties
                .iter()
                .find(|(key, _)| key == "name")
                .map(|(_, value)| value.clone())
                .unwrap_or_else(|| format!("{factory}{index}"));
            if !names.insert(name.clone()) {
                return Err(FrameworkError::Parse(format!("name '{name}' is not unique")));
            }

            elements.push(Element { name, kind });
        }

        let source = source.ok_or_else(|| {
            FrameworkError::Parse("pipeline has no source element".into())
        })?;

        Ok(Self {
            elements,
            source,
            handler: None,
            bus: Arc::new(Mutex::new(None)),
            streaming: None,
        })
    }

    fn stop_streaming(&mut self) -> bool {
        let Some(streaming) = self.streaming.take() else {
            return false;
        };
        let Streaming {
            _stop: stop,
            thread,
        } = streaming;
        drop(stop);

        let current: ThreadId = thread::current().id();
        if thread.thread().id() == current {
            tracing::debug!("idle requested from streaming thread, not joining");
        } else if thread.join().is_err() {
            tracing::error!("synthetic streaming thread panicked");
        }
        true
    }
}

impl Pipeline for SyntheticPipeline {
    fn find_stage(&self, name: &str) -> Option<StageRef> {
        self.elements
            .iter()
            .position(|element| element.name == name && element.kind == ElementKind::Sink)
            .map(StageRef::new)
    }

    fn connect_buffer_ready(
        &mut self,
        stage: StageRef,
        handler: BufferReadyHandler,
    ) -> Result<(), FrameworkError> {
        match self.elements.get(stage.index()) {
            Some(element) if element.kind == ElementKind::Sink => {
                self.handler = Some(handler);
                Ok(())
            }
            _ => Err(FrameworkError::UnknownStage(stage.index())),
        }
    }

    fn add_bus_watch(&mut self, handler: BusHandler) {
        if let Ok(mut slot) = self.bus.lock() {
            *slot = Some(handler);
        }
    }

    fn remove_bus_watch(&mut self) {
        if let Ok(mut slot) = self.bus.lock() {
            *slot = None;
        }
    }

    fn set_state(&mut self, state: TargetState) -> Result<(), FrameworkError> {
        match state {
            TargetState::Playing => {
                if self.streaming.is_some() {
                    return Ok(());
                }

                let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
                let source = self.source.clone();
                let handler = self.handler.clone();
                let bus = self.bus.clone();
                let thread = thread::Builder::new()
                    .name("synthetic-streaming".to_string())
                    .spawn(move || stream(source, handler, bus, stop_rx))
                    .map_err(|err| FrameworkError::StateChange(err.to_string()))?;

                self.streaming = Some(Streaming {
                    _stop: stop_tx,
                    thread,
                });
                post(
                    &self.bus,
                    BusMessage::StateChanged {
                        from: TargetState::Idle,
                        to: TargetState::Playing,
                    },
                );
            }
            TargetState::Idle => {
                if self.stop_streaming() {
                    post(
                        &self.bus,
                        BusMessage::StateChanged {
                            from: TargetState::Playing,
                            to: TargetState::Idle,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

impl Drop for SyntheticPipeline {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

struct ReadyBuffer<'a> {
    data: Option<&'a [u8]>,
}

impl PullBuffer for ReadyBuffer<'_> {
    fn pull_next_buffer(&mut self) -> Option<&[u8]> {
        self.data.take()
    }
}

fn stream(
    source: SourceSpec,
    handler: Option<BufferReadyHandler>,
    bus: BusSlot,
    stop: Receiver<()>,
) {
    post(&bus, BusMessage::StreamStart);

    let mut produced: u64 = 0;
    loop {
        if source.error_after.is_some_and(|limit| produced >= limit) {
            post(
                &bus,
                BusMessage::Error {
                    message: source.error_message.clone(),
                    debug: Some(format!("raised after {produced} buffers")),
                },
            );
            return;
        }

        let Some(size) = source.size_of(produced) else {
            post(&bus, BusMessage::EndOfStream);
            return;
        };

        // Only valid for this iteration, like a mapped framework buffer.
        let data = vec![produced as u8; size];
        if let Some(handler) = &handler {
            let mut ready = ReadyBuffer { data: Some(&data) };
            match handler(&mut ready) {
                Ok(()) => {}
                Err(FlowError::Flushing) => {
                    tracing::debug!(produced, "streaming flushed");
                    return;
                }
                Err(FlowError::Error) => {
                    post(
                        &bus,
                        BusMessage::Error {
                            message: "internal data flow error".into(),
                            debug: Some("streaming stopped, reason error".into()),
                        },
                    );
                    return;
                }
            }
        }
        produced += 1;

        match stop.recv_timeout(source.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}

fn post(bus: &BusSlot, message: BusMessage) {
    let handler = bus.lock().ok().and_then(|slot| slot.clone());
    if let Some(handler) = handler {
        handler(message);
    }
}

fn parse_source(properties: &[(String, String)]) -> Result<SourceSpec, FrameworkError> {
    let mut size = DEFAULT_BUFFER_SIZE;
    let mut count = None;
    let mut explicit = None;
    let mut interval = Duration::ZERO;
    let mut error_after = None;
    let mut error_message = String::from("synthetic source error");

    for (key, value) in properties {
        match key.as_str() {
            "name" => {}
            "size" => size = parse_number(key, value)?,
            "num-buffers" if value == "-1" => count = None,
            "num-buffers" => count = Some(parse_number(key, value)?),
            "sizes" => {
                let sizes = value
                    .split(',')
                    .map(|item| parse_number(key, item.trim()))
                    .collect::<Result<Vec<usize>, _>>()?;
                explicit = Some(sizes);
            }
            "interval-ms" => interval = Duration::from_millis(parse_number(key, value)?),
            "error-after" => error_after = Some(parse_number(key, value)?),
            "error-message" => error_message = value.clone(),
            other => {
                return Err(FrameworkError::Parse(format!(
                    "no property \"{other}\" in element \"testsrc\""
                )))
            }
        }
    }

    let sizes = match explicit {
        Some(sizes) => SizePlan::Explicit(sizes),
        None => SizePlan::Fixed { size, count },
    };

    Ok(SourceSpec {
        sizes,
        interval,
        error_after,
        error_message,
    })
}

fn check_properties(
    factory: &str,
    properties: &[(String, String)],
    allowed: &[&str],
) -> Result<(), FrameworkError> {
    match properties
        .iter()
        .find(|(key, _)| key != "name" && !allowed.contains(&key.as_str()))
    {
        Some((key, _)) => Err(FrameworkError::Parse(format!(
            "no property \"{key}\" in element \"{factory}\""
        ))),
        None => Ok(()),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, FrameworkError> {
    value
        .parse()
        .map_err(|_| FrameworkError::Parse(format!("could not set property \"{key}\" to \"{value}\"")))
}

fn parse_property(factory: &str, token: &str) -> Result<(String, String), FrameworkError> {
    match token.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(FrameworkError::Parse(format!(
            "malformed property \"{token}\" for element \"{factory}\""
        ))),
    }
}

/// Splits on `is_separator` outside of double quotes.
fn split_quoted(
    input: &str,
    is_separator: impl Fn(char) -> bool,
    strip_quotes: bool,
) -> Result<Vec<String>, FrameworkError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        if c == '"' {
            quoted = !quoted;
            if !strip_quotes {
                current.push(c);
            }
        } else if !quoted && is_separator(c) {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }

    if quoted {
        return Err(FrameworkError::Parse("unterminated quote".into()));
    }
    parts.push(current);
    Ok(parts)
}
