//! GStreamer realization of a `Topology`.
//!
//! Detections travel on buffers as `GstVideoRegionOfInterestMeta`: the ROI type is
//! the label, the rectangle is the box and the ROI id is the tracking id. An
//! optional `detection` param carries `class-id` and `confidence`. After the
//! engine runs, each suppressed ROI gets a `redaction-style` param describing the
//! fill the draw stage should apply.

use std::collections::HashMap;

use gstreamer::prelude::*;
use gstreamer_video::VideoRegionOfInterestMeta;

use super::{GraphBackend, LinkKind, LinkSpec, RoiMetaWatch, StageRole, StageSpec, Topology};
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::lifecycle::{
    GraphRunner, LifecycleEvent, LifecycleMachine, PipelineState, RunOutcome, ShutdownHandle,
};
use crate::meta::{BoundingBox, DetectionRecord, FrameBatch, FrameRecord};
use crate::negotiate::{EntryPoint, MediaPad, NegotiationHandler};
use crate::policy::Treatment;
use crate::redact::RedactionEngine;

/// Pipeline name, also the basename of the debug graph dump.
pub const PIPELINE_NAME: &str = "redaction-pipeline";

const DETECTION_PARAM: &str = "detection";
const STYLE_PARAM: &str = "redaction-style";
/// Class id for ROIs that carry no `detection` param; no policy rule matches it.
const UNCLASSIFIED: u32 = u32::MAX;

impl MediaPad for gstreamer::Pad {
    fn media_type(&self) -> Option<String> {
        let caps = self.current_caps().unwrap_or_else(|| self.query_caps(None));
        caps.structure(0).map(|s| s.name().to_string())
    }

    fn describe(&self) -> String {
        self.name().to_string()
    }
}

struct GstEntry {
    upstream: StageRole,
    downstream: StageRole,
    sink: gstreamer::Pad,
}

impl EntryPoint for GstEntry {
    type Candidate = gstreamer::Pad;

    fn is_linked(&self) -> bool {
        self.sink.is_linked()
    }

    fn link_from(&self, candidate: &gstreamer::Pad) -> Result<(), PipelineError> {
        candidate
            .link(&self.sink)
            .map(|_| ())
            .map_err(|e| PipelineError::Link {
                upstream: self.upstream,
                downstream: self.downstream,
                reason: format!("{:?}", e),
            })
    }
}

pub struct GstBackend {
    pipeline: gstreamer::Pipeline,
    elements: HashMap<StageRole, (gstreamer::Element, String)>,
    font_size: u32,
    detector: String,
}

impl GstBackend {
    pub fn new(settings: &PipelineSettings) -> Result<Self, PipelineError> {
        gstreamer::init()
            .map_err(|e| PipelineError::configuration(format!("initialize gstreamer: {}", e)))?;
        Ok(Self {
            pipeline: gstreamer::Pipeline::with_name(PIPELINE_NAME),
            elements: HashMap::new(),
            font_size: settings.osd_font_size,
            detector: settings.factories.detector.clone(),
        })
    }

    fn linked_pair(
        &self,
        link: &LinkSpec,
    ) -> Result<(&gstreamer::Element, &gstreamer::Element), PipelineError> {
        match (
            self.elements.get(&link.upstream),
            self.elements.get(&link.downstream),
        ) {
            (Some((up, _)), Some((down, _))) => Ok((up, down)),
            _ => Err(link_error(link, "stage not instantiated")),
        }
    }
}

fn link_error(link: &LinkSpec, reason: impl Into<String>) -> PipelineError {
    PipelineError::Link {
        upstream: link.upstream,
        downstream: link.downstream,
        reason: reason.into(),
    }
}

fn entry_pad(element: &gstreamer::Element, name: &str) -> Option<gstreamer::Pad> {
    element
        .static_pad(name)
        .or_else(|| element.request_pad_simple(name))
}

impl GraphBackend for GstBackend {
    type Graph = GstGraph;

    fn add_stage(&mut self, spec: &StageSpec) -> Result<(), PipelineError> {
        let fail = |reason: String| PipelineError::StageConstruction {
            role: spec.role,
            factory: spec.factory.clone(),
            reason,
        };

        let element = gstreamer::ElementFactory::make(&spec.factory)
            .name(spec.name.as_str())
            .build()
            .map_err(|e| fail(e.to_string()))?;
        for (key, value) in &spec.properties {
            if element.find_property(key).is_none() {
                return Err(fail(format!("no property '{}'", key)));
            }
            element.set_property_from_str(key, &value.to_string());
        }
        self.pipeline
            .add(&element)
            .map_err(|e| fail(e.to_string()))?;
        self.elements
            .insert(spec.role, (element, spec.factory.clone()));
        Ok(())
    }

    fn link(&mut self, link: &LinkSpec) -> Result<(), PipelineError> {
        let (up, down) = self.linked_pair(link)?;
        match &link.kind {
            LinkKind::Static => up.link(down).map_err(|e| link_error(link, e.to_string())),
            LinkKind::Request { pad } => {
                let sink = entry_pad(down, pad)
                    .ok_or_else(|| link_error(link, format!("no pad {}", pad)))?;
                let src = up
                    .static_pad("src")
                    .ok_or_else(|| link_error(link, "upstream has no src pad"))?;
                src.link(&sink)
                    .map(|_| ())
                    .map_err(|e| link_error(link, format!("{:?}", e)))
            }
            LinkKind::Negotiated { pad } => {
                let sink = entry_pad(down, pad)
                    .ok_or_else(|| link_error(link, format!("no pad {}", pad)))?;
                let handler = NegotiationHandler::new(GstEntry {
                    upstream: link.upstream,
                    downstream: link.downstream,
                    sink,
                });
                up.connect_pad_added(move |_, new_pad| {
                    handler.attach(new_pad);
                });
                Ok(())
            }
        }
    }

    fn install_engine(
        &mut self,
        role: StageRole,
        engine: RedactionEngine,
    ) -> Result<(), PipelineError> {
        let (element, factory) = self.elements.get(&role).ok_or_else(|| {
            PipelineError::configuration(format!(
                "no {} stage to install the redaction engine on",
                role
            ))
        })?;
        let fail = |reason: &str| PipelineError::StageConstruction {
            role,
            factory: factory.clone(),
            reason: reason.to_string(),
        };
        let pad = element.static_pad("sink").ok_or_else(|| fail("no sink pad"))?;

        let font_size = self.font_size;
        let watch = RoiMetaWatch::new(self.detector.as_str());
        if !watch.detector_publishes_roi_meta() {
            log::warn!(
                "detector '{}' does not attach region-of-interest metadata; \
                 redaction needs a detector that does",
                self.detector
            );
        }
        pad.add_probe(gstreamer::PadProbeType::BUFFER, move |_, info| {
            if let Some(gstreamer::PadProbeData::Buffer(ref mut buffer)) = info.data {
                redact_buffer(buffer.make_mut(), &engine, &watch, font_size);
            }
            gstreamer::PadProbeReturn::Ok
        })
        .ok_or_else(|| fail("buffer probe rejected"))?;
        Ok(())
    }

    fn finish(self, topology: Topology) -> Result<GstGraph, PipelineError> {
        gstreamer::debug_bin_to_dot_file(
            &self.pipeline,
            gstreamer::DebugGraphDetails::all(),
            PIPELINE_NAME,
        );
        Ok(GstGraph {
            pipeline: self.pipeline,
            topology,
        })
    }
}

fn record_from_roi(meta: &VideoRegionOfInterestMeta, font_size: u32) -> DetectionRecord {
    let (left, top, width, height) = meta.rect();
    let detection = meta.param(DETECTION_PARAM);
    let class_id = detection
        .and_then(|s| s.get::<u32>("class-id").ok())
        .unwrap_or(UNCLASSIFIED);
    let confidence = detection
        .and_then(|s| s.get::<f64>("confidence").ok())
        .unwrap_or(0.0);

    let mut record = DetectionRecord::new(class_id, BoundingBox::new(left, top, width, height))
        .with_label(meta.roi_type())
        .with_font_size(font_size)
        .with_confidence(confidence as f32);
    if meta.id() >= 0 {
        record = record.with_tracking_id(meta.id() as u64);
    }
    record
}

fn style_structure(record: &DetectionRecord) -> gstreamer::Structure {
    let style = &record.style;
    let (text_bg, font_size) = record
        .label
        .as_ref()
        .map(|l| (l.set_bg_clr, l.font.size))
        .unwrap_or((false, 0));
    gstreamer::Structure::builder(STYLE_PARAM)
        .field("border-width", style.border_width)
        .field("has-bg-color", style.has_bg_color)
        .field("bg-red", style.bg_color.red)
        .field("bg-green", style.bg_color.green)
        .field("bg-blue", style.bg_color.blue)
        .field("bg-alpha", style.bg_color.alpha)
        .field("text-bg", text_bg)
        .field("font-size", font_size)
        .build()
}

fn redact_buffer(
    buffer: &mut gstreamer::BufferRef,
    engine: &RedactionEngine,
    watch: &RoiMetaWatch,
    font_size: u32,
) {
    let objects: Vec<DetectionRecord> = buffer
        .iter_meta::<VideoRegionOfInterestMeta>()
        .map(|meta| record_from_roi(&meta, font_size))
        .collect();
    watch.observe(objects.len());
    let frame = FrameRecord::new(engine.context().current_index(), 0).with_objects(objects);
    let mut batch = FrameBatch::single(frame);
    engine.process_batch(&mut batch);

    let Some(frame) = batch.frames.first() else {
        return;
    };
    for (mut meta, record) in buffer
        .iter_meta_mut::<VideoRegionOfInterestMeta>()
        .zip(frame.objects.iter())
    {
        let suppressed = matches!(
            engine.policy().treatment_for(record.class_id),
            Treatment::Suppress { .. }
        );
        if suppressed && meta.param(STYLE_PARAM).is_none() {
            meta.add_param(style_structure(record));
        }
    }
}

fn state_from_gst(state: gstreamer::State) -> Option<PipelineState> {
    match state {
        gstreamer::State::Null => Some(PipelineState::Null),
        gstreamer::State::Ready => Some(PipelineState::Ready),
        gstreamer::State::Paused => Some(PipelineState::Paused),
        gstreamer::State::Playing => Some(PipelineState::Playing),
        _ => None,
    }
}

fn translate(message: &gstreamer::Message, top: &gstreamer::Object) -> Option<LifecycleEvent> {
    use gstreamer::MessageView;
    match message.view() {
        MessageView::Eos(..) => Some(LifecycleEvent::EndOfStream),
        MessageView::Error(err) => Some(LifecycleEvent::Error {
            stage: err
                .src()
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            message: err.error().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        }),
        MessageView::StateChanged(change) => Some(LifecycleEvent::StateChanged {
            from_top_level: change.src().map(|s| s == top).unwrap_or(false),
            old: state_from_gst(change.old())?,
            new: state_from_gst(change.current())?,
        }),
        _ => None,
    }
}

pub struct GstGraph {
    pipeline: gstreamer::Pipeline,
    topology: Topology,
}

impl GstGraph {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        let target = match state {
            PipelineState::Null => gstreamer::State::Null,
            PipelineState::Ready => gstreamer::State::Ready,
            PipelineState::Paused => gstreamer::State::Paused,
            PipelineState::Playing => gstreamer::State::Playing,
        };
        self.pipeline
            .set_state(target)
            .map(|_| ())
            .map_err(|_| PipelineError::StateChange(state))
    }
}

impl GraphRunner for GstGraph {
    fn shutdown_handle(&self) -> ShutdownHandle {
        let pipeline = self.pipeline.clone();
        ShutdownHandle::new(move || {
            if !pipeline.send_event(gstreamer::event::Eos::new()) {
                log::warn!("pipeline did not accept end-of-stream");
            }
        })
    }

    fn run(self, machine: &mut LifecycleMachine) -> Result<RunOutcome, PipelineError> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| PipelineError::configuration("pipeline has no bus"))?;

        if let Err(e) = self.set_state(PipelineState::Playing) {
            let _ = self.set_state(PipelineState::Null);
            return Err(e);
        }

        let top = self.pipeline.clone().upcast::<gstreamer::Object>();
        let outcome = machine.drive(
            bus.iter_timed(gstreamer::ClockTime::NONE)
                .filter_map(|message| translate(&message, &top)),
        );

        self.set_state(PipelineState::Null)?;
        Ok(outcome)
    }
}
