//! Graph topology assembly.
//!
//! `Topology::plan` turns a run `Configuration` into a declarative description of
//! one of four graph shapes ({file, capture} input x {display, file} output). All
//! four share the same core:
//!
//! ```text
//! stream-mux -> detector -> draw-convert -> draw
//! ```
//!
//! `assemble` realizes a plan through a `GraphBackend`: every stage is created
//! first, then every link, then the redaction engine is installed in front of the
//! draw stage. Any failure aborts assembly; there is no partial graph.
//!
//! Backends:
//! - `sim`: in-process simulated graph (`stub://` inputs, tests)
//! - `gst`: GStreamer (feature: gstreamer)

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod sim;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{Configuration, InputSource, OutputSink, PipelineSettings};
use crate::error::PipelineError;
use crate::redact::RedactionEngine;

/// Request pad on the stream multiplexer that the input branch feeds.
pub const MUX_ENTRY_PAD: &str = "sink_0";

/// Caps the capture branch requests from the camera converter.
const NVMM_NV12_CAPS: &str = "video/x-raw(memory:NVMM), format=NV12";
/// Caps the encoder branch expects after leaving device memory.
const ENCODER_INPUT_CAPS: &str = "video/x-raw, format=I420";

/// Position of a stage in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageRole {
    Source,
    Decoder,
    CaptureFilter,
    CaptureConvert,
    CaptureUpload,
    CaptureUploadFilter,
    StreamMux,
    Detector,
    DrawConvert,
    Draw,
    DisplaySink,
    OutputConvert,
    OutputFilter,
    Encoder,
    Muxer,
    FileSink,
}

/// Stages shared by every topology variant, in data-flow order.
pub const CORE_ROLES: [StageRole; 4] = [
    StageRole::StreamMux,
    StageRole::Detector,
    StageRole::DrawConvert,
    StageRole::Draw,
];

impl StageRole {
    /// Element name used when the stage is instantiated.
    pub fn element_name(self) -> &'static str {
        match self {
            StageRole::Source => "source",
            StageRole::Decoder => "decoder",
            StageRole::CaptureFilter => "capture-filter",
            StageRole::CaptureConvert => "capture-convert",
            StageRole::CaptureUpload => "capture-upload",
            StageRole::CaptureUploadFilter => "capture-upload-filter",
            StageRole::StreamMux => "stream-mux",
            StageRole::Detector => "detector",
            StageRole::DrawConvert => "draw-convert",
            StageRole::Draw => "draw",
            StageRole::DisplaySink => "display-sink",
            StageRole::OutputConvert => "output-convert",
            StageRole::OutputFilter => "output-filter",
            StageRole::Encoder => "encoder",
            StageRole::Muxer => "muxer",
            StageRole::FileSink => "file-sink",
        }
    }

    pub fn is_core(self) -> bool {
        CORE_ROLES.contains(&self)
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name())
    }
}

/// Property value, rendered in the textual form element properties accept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    UInt(u64),
    Str(String),
    Caps(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Str(v) | PropertyValue::Caps(v) => f.write_str(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub role: StageRole,
    pub factory: String,
    pub name: String,
    pub properties: Vec<(String, PropertyValue)>,
}

impl StageSpec {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// How two stages are connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// Fixed pads, linked at assembly time.
    Static,
    /// Upstream's source pad to a named (request) pad downstream, at assembly time.
    Request { pad: String },
    /// Upstream output appears at runtime; linked once by the negotiation handler.
    Negotiated { pad: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSpec {
    pub upstream: StageRole,
    pub downstream: StageRole,
    pub kind: LinkKind,
}

impl LinkSpec {
    pub fn is_core(&self) -> bool {
        self.upstream.is_core() && self.downstream.is_core()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyVariant {
    FileToDisplay,
    FileToFile,
    CaptureToDisplay,
    CaptureToFile,
}

impl TopologyVariant {
    pub fn of(config: &Configuration) -> Self {
        match (&config.input, &config.output) {
            (InputSource::File(_), OutputSink::Display) => TopologyVariant::FileToDisplay,
            (InputSource::File(_), OutputSink::File(_)) => TopologyVariant::FileToFile,
            (InputSource::Capture(_), OutputSink::Display) => TopologyVariant::CaptureToDisplay,
            (InputSource::Capture(_), OutputSink::File(_)) => TopologyVariant::CaptureToFile,
        }
    }
}

/// Declarative description of a graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    variant: TopologyVariant,
    stages: Vec<StageSpec>,
    links: Vec<LinkSpec>,
}

impl Topology {
    pub fn plan(config: &Configuration, settings: &PipelineSettings) -> Self {
        let factories = &settings.factories;
        let mut topo = Topology {
            variant: TopologyVariant::of(config),
            stages: Vec::new(),
            links: Vec::new(),
        };

        match &config.input {
            InputSource::File(path) => {
                topo.add_stage(
                    StageRole::Source,
                    &factories.file_source,
                    vec![(
                        "location",
                        PropertyValue::Str(path.to_string_lossy().into_owned()),
                    )],
                );
                topo.add_stage(StageRole::Decoder, &factories.decoder, vec![]);
                topo.add_link(StageRole::Source, StageRole::Decoder, LinkKind::Static);
                topo.add_link(
                    StageRole::Decoder,
                    StageRole::StreamMux,
                    LinkKind::Negotiated {
                        pad: MUX_ENTRY_PAD.to_string(),
                    },
                );
            }
            InputSource::Capture(device) => {
                topo.add_stage(
                    StageRole::Source,
                    &factories.capture_source,
                    vec![("device", PropertyValue::Str(device.clone()))],
                );
                topo.add_stage(
                    StageRole::CaptureFilter,
                    &factories.caps_filter,
                    vec![("caps", PropertyValue::Caps(settings.capture_caps.clone()))],
                );
                topo.add_stage(StageRole::CaptureConvert, &factories.capture_convert, vec![]);
                topo.add_stage(StageRole::CaptureUpload, &factories.converter, vec![]);
                topo.add_stage(
                    StageRole::CaptureUploadFilter,
                    &factories.caps_filter,
                    vec![("caps", PropertyValue::Caps(NVMM_NV12_CAPS.to_string()))],
                );
                topo.add_chain(&[
                    StageRole::Source,
                    StageRole::CaptureFilter,
                    StageRole::CaptureConvert,
                    StageRole::CaptureUpload,
                    StageRole::CaptureUploadFilter,
                ]);
                topo.add_link(
                    StageRole::CaptureUploadFilter,
                    StageRole::StreamMux,
                    LinkKind::Request {
                        pad: MUX_ENTRY_PAD.to_string(),
                    },
                );
            }
        }

        let mut mux_properties = vec![
            ("batch-size", PropertyValue::UInt(settings.mux.batch_size.into())),
            ("width", PropertyValue::UInt(settings.mux.width.into())),
            ("height", PropertyValue::UInt(settings.mux.height.into())),
            (
                "batched-push-timeout",
                PropertyValue::UInt(settings.mux.batched_push_timeout_us.into()),
            ),
        ];
        if config.input.is_live() {
            mux_properties.push(("live-source", PropertyValue::Bool(true)));
        }
        topo.add_stage(StageRole::StreamMux, &factories.stream_mux, mux_properties);
        topo.add_stage(
            StageRole::Detector,
            &factories.detector,
            vec![(
                "config-file-path",
                PropertyValue::Str(config.detector_config.to_string_lossy().into_owned()),
            )],
        );
        topo.add_stage(StageRole::DrawConvert, &factories.converter, vec![]);
        topo.add_stage(StageRole::Draw, &factories.draw, vec![]);
        topo.add_chain(&CORE_ROLES);

        match &config.output {
            OutputSink::Display => {
                // Recorded input keeps its own pacing; live input renders as soon as possible.
                let properties = if config.input.is_live() {
                    vec![
                        ("sync", PropertyValue::Bool(false)),
                        ("qos", PropertyValue::Bool(true)),
                    ]
                } else {
                    vec![("sync", PropertyValue::Bool(true))]
                };
                topo.add_stage(StageRole::DisplaySink, &factories.display_sink, properties);
                topo.add_link(StageRole::Draw, StageRole::DisplaySink, LinkKind::Static);
            }
            OutputSink::File(path) => {
                topo.add_stage(StageRole::OutputConvert, &factories.converter, vec![]);
                topo.add_stage(
                    StageRole::OutputFilter,
                    &factories.caps_filter,
                    vec![("caps", PropertyValue::Caps(ENCODER_INPUT_CAPS.to_string()))],
                );
                topo.add_stage(
                    StageRole::Encoder,
                    &factories.encoder,
                    vec![("bitrate", PropertyValue::UInt(settings.encoder_bitrate.into()))],
                );
                topo.add_stage(StageRole::Muxer, &factories.muxer, vec![]);
                topo.add_stage(
                    StageRole::FileSink,
                    &factories.file_sink,
                    vec![(
                        "location",
                        PropertyValue::Str(path.to_string_lossy().into_owned()),
                    )],
                );
                topo.add_chain(&[
                    StageRole::Draw,
                    StageRole::OutputConvert,
                    StageRole::OutputFilter,
                    StageRole::Encoder,
                    StageRole::Muxer,
                    StageRole::FileSink,
                ]);
            }
        }

        topo
    }

    fn add_stage(&mut self, role: StageRole, factory: &str, properties: Vec<(&str, PropertyValue)>) {
        self.stages.push(StageSpec {
            role,
            factory: factory.to_string(),
            name: role.element_name().to_string(),
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }

    fn add_link(&mut self, upstream: StageRole, downstream: StageRole, kind: LinkKind) {
        self.links.push(LinkSpec {
            upstream,
            downstream,
            kind,
        });
    }

    fn add_chain(&mut self, roles: &[StageRole]) {
        for pair in roles.windows(2) {
            self.add_link(pair[0], pair[1], LinkKind::Static);
        }
    }

    pub fn variant(&self) -> TopologyVariant {
        self.variant
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn links(&self) -> &[LinkSpec] {
        &self.links
    }

    pub fn stage(&self, role: StageRole) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.role == role)
    }

    pub fn has_role(&self, role: StageRole) -> bool {
        self.stage(role).is_some()
    }

    /// Core stages in data-flow order.
    pub fn core_stages(&self) -> Vec<&StageSpec> {
        CORE_ROLES.iter().filter_map(|role| self.stage(*role)).collect()
    }

    /// Role and factory of each core stage, in data-flow order.
    ///
    /// Properties are left out: the mux is tuned per input (`live-source`), but
    /// the elements and their order never change.
    pub fn core_shape(&self) -> Vec<(StageRole, &str)> {
        self.core_stages()
            .into_iter()
            .map(|s| (s.role, s.factory.as_str()))
            .collect()
    }

    pub fn core_links(&self) -> Vec<&LinkSpec> {
        self.links.iter().filter(|l| l.is_core()).collect()
    }

    /// Stage whose input the redaction engine inspects.
    pub fn probe_role(&self) -> StageRole {
        StageRole::Draw
    }
}

/// Detector factories that publish DeepStream batch metadata only, never
/// `GstVideoRegionOfInterestMeta`.
pub const BATCH_META_DETECTORS: [&str; 2] = ["nvinfer", "nvinferserver"];

/// Checks that buffers reaching the engine carry region-of-interest metadata.
///
/// The media backend reads detections from ROI metas only. Behind a detector
/// that never attaches them every buffer arrives empty and nothing is redacted,
/// so the first such buffer logs a warning. Later ones stay quiet.
#[derive(Debug)]
pub struct RoiMetaWatch {
    detector: String,
    warned: AtomicBool,
}

impl RoiMetaWatch {
    pub fn new(detector: impl Into<String>) -> Self {
        Self {
            detector: detector.into(),
            warned: AtomicBool::new(false),
        }
    }

    /// False for detectors that publish batch metadata only.
    pub fn detector_publishes_roi_meta(&self) -> bool {
        !BATCH_META_DETECTORS.contains(&self.detector.as_str())
    }

    /// Record the ROI count of one buffer. True when this call logged the warning.
    pub fn observe(&self, roi_count: usize) -> bool {
        if roi_count > 0 || self.detector_publishes_roi_meta() {
            return false;
        }
        if self.warned.swap(true, Ordering::AcqRel) {
            return false;
        }
        log::warn!(
            "buffer without region-of-interest metadata behind detector '{}': \
             it publishes batch metadata only, so frames pass through unredacted",
            self.detector
        );
        true
    }
}

/// Realizes a `Topology` on a concrete media framework.
pub trait GraphBackend {
    type Graph;

    /// Instantiate and configure one stage.
    fn add_stage(&mut self, spec: &StageSpec) -> Result<(), PipelineError>;

    /// Connect two previously added stages.
    fn link(&mut self, link: &LinkSpec) -> Result<(), PipelineError>;

    /// Run `engine` on every buffer entering the stage at `role`.
    fn install_engine(&mut self, role: StageRole, engine: RedactionEngine)
        -> Result<(), PipelineError>;

    fn finish(self, topology: Topology) -> Result<Self::Graph, PipelineError>;
}

/// Plan and realize the graph for `config`.
pub fn assemble<B: GraphBackend>(
    config: &Configuration,
    settings: &PipelineSettings,
    engine: RedactionEngine,
    mut backend: B,
) -> Result<B::Graph, PipelineError> {
    let topology = Topology::plan(config, settings);
    log::info!(
        "assembling {:?} graph: {} stages, {} links",
        topology.variant(),
        topology.stages().len(),
        topology.links().len()
    );

    for stage in topology.stages() {
        log::debug!("creating {} ({})", stage.role, stage.factory);
        backend.add_stage(stage)?;
    }
    for link in topology.links() {
        backend.link(link)?;
    }
    backend.install_engine(topology.probe_role(), engine)?;
    backend.finish(topology)
}
