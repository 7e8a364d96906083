//! Redaction kernel
//!
//! Controller for detector-driven video graphs that black out sensitive objects
//! (faces, license plates) before frames are displayed or encoded.
//!
//! # Architecture
//!
//! 1. `config` + `cli`: the run configuration and the file/env tunables.
//! 2. `topology`: plans one of four graph shapes and realizes it on a backend.
//! 3. `negotiate`: links the first video output of a dynamic decoder, once.
//! 4. `redact`: the per-batch engine applying `policy` and exporting KITTI files.
//! 5. `lifecycle`: consumes graph events and reports how the run ended.
//!
//! # Module Structure
//!
//! - `meta`: detection/frame/batch records handed to the engine
//! - `context`: the batch counter shared between delivery and the run loop
//! - `error`: `PipelineError` and process exit codes

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod meta;
pub mod negotiate;
pub mod policy;
pub mod redact;
pub mod topology;

pub use cli::Cli;
pub use config::{Configuration, InputSource, OutputSink, PipelineSettings, StageFactories};
pub use context::RunContext;
pub use error::{PipelineError, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
pub use lifecycle::{
    GraphRunner, LifecycleEvent, LifecycleMachine, PipelineState, RunOutcome, RunReport,
    ShutdownHandle,
};
pub use meta::{BoundingBox, DetectionRecord, FrameBatch, FrameRecord, Rgba};
pub use negotiate::{EntryPoint, LinkState, MediaPad, NegotiationHandler};
pub use policy::{RedactionPolicy, Treatment};
pub use redact::{BatchOutcome, RedactionEngine};
pub use topology::sim::{SimBackend, SimGraph, SimPad, SyntheticFeed};
pub use topology::{assemble, GraphBackend, LinkKind, StageRole, Topology, TopologyVariant};

#[cfg(feature = "gstreamer")]
pub use topology::gst::{GstBackend, GstGraph};
