//! Run lifecycle: graph state tracking, end-of-stream and error handling.
//!
//! Backends translate their bus messages into `LifecycleEvent`s and feed them to
//! a `LifecycleMachine`, which decides when the run is over and how it ended.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::RunContext;
use crate::error::{PipelineError, EXIT_FAILURE, EXIT_OK};

/// Stage reported when the event source disappears without a terminal event.
pub const RUN_LOOP_STAGE: &str = "run-loop";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged {
        from_top_level: bool,
        old: PipelineState,
        new: PipelineState,
    },
    Error {
        stage: String,
        message: String,
        debug: Option<String>,
    },
    EndOfStream,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub frames: u64,
    pub elapsed: Duration,
    /// Frames per second; 0 when no time elapsed.
    pub throughput: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    Failed { stage: String, message: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) => EXIT_OK,
            RunOutcome::Failed { .. } => EXIT_FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    /// The report of a completed run, or the stream error that ended it.
    pub fn into_result(self) -> Result<RunReport, PipelineError> {
        match self {
            RunOutcome::Completed(report) => Ok(report),
            RunOutcome::Failed { stage, message } => Err(PipelineError::Stream { stage, message }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Flow {
    Continue,
    Stop(RunOutcome),
}

/// Frame count and start/end instants of one run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunStatistics {
    /// Batches delivered, as of end of stream.
    pub frames: u64,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl RunStatistics {
    /// Time between the first entry into Playing and end of stream.
    ///
    /// Zero when either end is missing.
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct LifecycleMachine {
    context: Arc<RunContext>,
    state: PipelineState,
    stats: RunStatistics,
    finished: Option<RunOutcome>,
}

impl LifecycleMachine {
    pub fn new(context: Arc<RunContext>) -> Self {
        Self {
            context,
            state: PipelineState::Null,
            stats: RunStatistics::default(),
            finished: None,
        }
    }

    /// Last top-level state observed.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn statistics(&self) -> RunStatistics {
        self.stats
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.finished.as_ref()
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Flow {
        self.handle_at(event, Instant::now())
    }

    /// `handle` with an explicit clock reading.
    pub fn handle_at(&mut self, event: LifecycleEvent, now: Instant) -> Flow {
        if let Some(outcome) = &self.finished {
            return Flow::Stop(outcome.clone());
        }

        match event {
            LifecycleEvent::StateChanged {
                from_top_level,
                old,
                new,
            } => {
                if !from_top_level {
                    return Flow::Continue;
                }
                log::debug!("pipeline state {:?} -> {:?}", old, new);
                self.state = new;
                if new == PipelineState::Playing && self.stats.started_at.is_none() {
                    self.stats.started_at = Some(now);
                    log::info!("pipeline playing");
                }
                Flow::Continue
            }
            LifecycleEvent::Error {
                stage,
                message,
                debug,
            } => {
                log::error!("error from {}: {}", stage, message);
                if let Some(debug) = debug {
                    log::debug!("debug info: {}", debug);
                }
                self.stop(RunOutcome::Failed { stage, message })
            }
            LifecycleEvent::EndOfStream => {
                self.stats.ended_at = Some(now);
                self.stats.frames = self.context.frame_count();
                let report = RunReport {
                    frames: self.stats.frames,
                    elapsed: self.stats.elapsed(),
                    throughput: self.stats.throughput(),
                };
                log::info!("end of stream: {}", report);
                self.stop(RunOutcome::Completed(report))
            }
        }
    }

    fn stop(&mut self, outcome: RunOutcome) -> Flow {
        self.finished = Some(outcome.clone());
        Flow::Stop(outcome)
    }

    /// Feed events until one stops the run.
    pub fn drive<I>(&mut self, events: I) -> RunOutcome
    where
        I: IntoIterator<Item = LifecycleEvent>,
    {
        for event in events {
            if let Flow::Stop(outcome) = self.handle(event) {
                return outcome;
            }
        }
        let outcome = RunOutcome::Failed {
            stage: RUN_LOOP_STAGE.to_string(),
            message: "event source closed before end of stream".to_string(),
        };
        log::error!("run loop ended without end of stream");
        self.finished = Some(outcome.clone());
        outcome
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames in {:.2}s ({:.2} fps)",
            self.frames,
            self.elapsed.as_secs_f64(),
            self.throughput
        )
    }
}

/// Requests an orderly stop of a running graph from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<dyn Fn() + Send + Sync>);

impl ShutdownHandle {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(stop))
    }

    pub fn request(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

/// An assembled graph that can be run to completion.
pub trait GraphRunner {
    fn shutdown_handle(&self) -> ShutdownHandle;

    /// Start the graph, feed its events to `machine` until it stops, then tear down.
    fn run(self, machine: &mut LifecycleMachine) -> Result<RunOutcome, PipelineError>;
}
