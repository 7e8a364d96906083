//! In-process simulated graph.
//!
//! Serves `stub://` inputs and tests. Stages are bookkeeping only; a delivery
//! thread plays a `SyntheticFeed` through the redaction engine and posts the same
//! lifecycle events a real bus would. Decoder outputs are announced at runtime,
//! audio first, so the negotiation path runs exactly as it does against real media.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use super::{GraphBackend, LinkKind, LinkSpec, StageRole, StageSpec, Topology};
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::lifecycle::{
    GraphRunner, LifecycleEvent, LifecycleMachine, PipelineState, RunOutcome, ShutdownHandle,
};
use crate::meta::{BoundingBox, DetectionRecord, FrameBatch, FrameRecord};
use crate::negotiate::{EntryPoint, MediaPad, NegotiationHandler};
use crate::redact::{BatchOutcome, RedactionEngine};

const BOX_SIZE: u32 = 64;
const SYNTHETIC_CONFIDENCE: f32 = 0.9;

/// A decoder output announced at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimPad {
    name: String,
    media_type: Option<String>,
}

impl SimPad {
    pub fn new(name: impl Into<String>, media_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.map(str::to_string),
        }
    }

    pub fn video(name: impl Into<String>) -> Self {
        Self::new(name, Some("video/x-raw"))
    }

    pub fn audio(name: impl Into<String>) -> Self {
        Self::new(name, Some("audio/x-raw"))
    }
}

impl MediaPad for SimPad {
    fn media_type(&self) -> Option<String> {
        self.media_type.clone()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Entry pad of the stream multiplexer.
pub struct SimEntry {
    upstream: StageRole,
    downstream: StageRole,
    pad: String,
    linked: Arc<AtomicBool>,
    refuse: bool,
}

impl EntryPoint for SimEntry {
    type Candidate = SimPad;

    fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    fn link_from(&self, candidate: &SimPad) -> Result<(), PipelineError> {
        if self.refuse {
            return Err(PipelineError::Link {
                upstream: self.upstream,
                downstream: self.downstream,
                reason: format!("{} refused {}", self.pad, candidate.describe()),
            });
        }
        self.linked.store(true, Ordering::Release);
        Ok(())
    }
}

/// Deterministic detections for a simulated run.
///
/// Each frame carries one object per configured label; label `i` has class id
/// `i`, so the default labels exercise both suppressed classes and passthrough.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticFeed {
    frames: u64,
    labels: Vec<String>,
    width: u32,
    height: u32,
    font_size: u32,
}

impl Default for SyntheticFeed {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

impl SyntheticFeed {
    pub fn new(frames: u64, labels: Vec<String>) -> Self {
        Self {
            frames,
            labels,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            frames: settings.synthetic_frames,
            labels: settings.class_labels.clone(),
            width: settings.mux.width,
            height: settings.mux.height,
            font_size: settings.osd_font_size,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The batch delivered as frame `n`.
    pub fn batch(&self, n: u64) -> FrameBatch {
        let size = BOX_SIZE.min(self.width).min(self.height);
        let span_x = u64::from((self.width - size).max(1));
        let span_y = u64::from((self.height - size).max(1));

        let objects = self
            .labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let i = i as u64;
                let left = ((n * 8 + i * 160) % span_x) as u32;
                let top = ((i * 120 + 40) % span_y) as u32;
                DetectionRecord::new(i as u32, BoundingBox::new(left, top, size, size))
                    .with_label(label.clone())
                    .with_font_size(self.font_size)
                    .with_tracking_id(i)
                    .with_confidence(SYNTHETIC_CONFIDENCE)
            })
            .collect();
        FrameBatch::single(FrameRecord::new(n, 0).with_objects(objects))
    }

    fn play(&self, core: &SimCore, stop: &AtomicBool, events: &Sender<LifecycleEvent>) {
        if core.negotiation.is_some() {
            core.announce(&SimPad::audio("src_0"));
            core.announce(&SimPad::video("src_1"));
        }

        for n in 0..self.frames {
            if stop.load(Ordering::Acquire) {
                log::info!("shutdown requested after {} frame(s)", n);
                break;
            }
            let mut batch = self.batch(n);
            if core.deliver(&mut batch).is_none() {
                let _ = events.send(LifecycleEvent::Error {
                    stage: StageRole::Decoder.to_string(),
                    message: "internal data stream error".to_string(),
                    debug: Some("streaming stopped, reason not-linked".to_string()),
                });
                return;
            }
        }
        let _ = events.send(LifecycleEvent::EndOfStream);
    }
}

pub struct SimBackend {
    factories: HashSet<String>,
    refused: HashSet<(StageRole, StageRole)>,
    feed: SyntheticFeed,
    stages: Vec<StageSpec>,
    links: Vec<LinkSpec>,
    entry: Arc<AtomicBool>,
    negotiation: Option<NegotiationHandler<SimEntry>>,
    engine: Option<RedactionEngine>,
}

impl SimBackend {
    /// Backend that can instantiate exactly `factories`.
    pub fn with_factories<I, S>(factories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            factories: factories.into_iter().map(Into::into).collect(),
            refused: HashSet::new(),
            feed: SyntheticFeed::default(),
            stages: Vec::new(),
            links: Vec::new(),
            entry: Arc::new(AtomicBool::new(false)),
            negotiation: None,
            engine: None,
        }
    }

    /// Backend with every configured factory available, playing the configured feed.
    pub fn for_settings(settings: &PipelineSettings) -> Self {
        let mut backend = Self::with_factories(settings.factories.all());
        backend.feed = SyntheticFeed::from_settings(settings);
        backend
    }

    pub fn without_factory(mut self, factory: &str) -> Self {
        self.factories.remove(factory);
        self
    }

    /// Make the link `upstream -> downstream` fail.
    pub fn refuse_link(mut self, upstream: StageRole, downstream: StageRole) -> Self {
        self.refused.insert((upstream, downstream));
        self
    }

    fn has_stage(&self, role: StageRole) -> bool {
        self.stages.iter().any(|s| s.role == role)
    }
}

impl GraphBackend for SimBackend {
    type Graph = SimGraph;

    fn add_stage(&mut self, spec: &StageSpec) -> Result<(), PipelineError> {
        let fail = |reason: &str| PipelineError::StageConstruction {
            role: spec.role,
            factory: spec.factory.clone(),
            reason: reason.to_string(),
        };
        if !self.factories.contains(&spec.factory) {
            return Err(fail("no such element factory"));
        }
        if self.has_stage(spec.role) {
            return Err(fail("stage already present"));
        }
        self.stages.push(spec.clone());
        Ok(())
    }

    fn link(&mut self, link: &LinkSpec) -> Result<(), PipelineError> {
        let fail = |reason: &str| PipelineError::Link {
            upstream: link.upstream,
            downstream: link.downstream,
            reason: reason.to_string(),
        };
        if !self.has_stage(link.upstream) || !self.has_stage(link.downstream) {
            return Err(fail("stage not instantiated"));
        }
        let refused = self.refused.contains(&(link.upstream, link.downstream));

        match &link.kind {
            LinkKind::Static => {
                if refused {
                    return Err(fail("pads are incompatible"));
                }
            }
            LinkKind::Request { pad } => {
                if refused {
                    return Err(fail(&format!("{} unavailable", pad)));
                }
                self.entry.store(true, Ordering::Release);
            }
            LinkKind::Negotiated { pad } => {
                // A refusal here only shows up once the decoder announces its output.
                self.negotiation = Some(NegotiationHandler::new(SimEntry {
                    upstream: link.upstream,
                    downstream: link.downstream,
                    pad: pad.clone(),
                    linked: Arc::clone(&self.entry),
                    refuse: refused,
                }));
            }
        }
        self.links.push(link.clone());
        Ok(())
    }

    fn install_engine(
        &mut self,
        role: StageRole,
        engine: RedactionEngine,
    ) -> Result<(), PipelineError> {
        if !self.has_stage(role) {
            return Err(PipelineError::configuration(format!(
                "no {} stage to install the redaction engine on",
                role
            )));
        }
        self.engine = Some(engine);
        Ok(())
    }

    fn finish(self, topology: Topology) -> Result<SimGraph, PipelineError> {
        let engine = self
            .engine
            .ok_or_else(|| PipelineError::configuration("redaction engine not installed"))?;
        Ok(SimGraph {
            topology,
            links: self.links,
            core: Arc::new(SimCore {
                engine,
                entry: self.entry,
                negotiation: self.negotiation,
            }),
            feed: self.feed,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct SimCore {
    engine: RedactionEngine,
    entry: Arc<AtomicBool>,
    negotiation: Option<NegotiationHandler<SimEntry>>,
}

impl SimCore {
    fn announce(&self, pad: &SimPad) -> bool {
        match &self.negotiation {
            Some(handler) => handler.attach(pad),
            None => false,
        }
    }

    fn deliver(&self, batch: &mut FrameBatch) -> Option<BatchOutcome> {
        if !self.entry.load(Ordering::Acquire) {
            return None;
        }
        Some(self.engine.process_batch(batch))
    }
}

/// An assembled simulated graph.
pub struct SimGraph {
    topology: Topology,
    links: Vec<LinkSpec>,
    core: Arc<SimCore>,
    feed: SyntheticFeed,
    stop: Arc<AtomicBool>,
}

impl SimGraph {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Links realized during assembly, in order.
    pub fn realized_links(&self) -> &[LinkSpec] {
        &self.links
    }

    pub fn with_feed(mut self, feed: SyntheticFeed) -> Self {
        self.feed = feed;
        self
    }

    pub fn entry_linked(&self) -> bool {
        self.core.entry.load(Ordering::Acquire)
    }

    /// Announce a new decoder output. True if it was linked to the core.
    pub fn announce_output(&self, pad: &SimPad) -> bool {
        self.core.announce(pad)
    }

    /// Push one batch through the core. `None` while the entry is unlinked.
    pub fn deliver(&self, batch: &mut FrameBatch) -> Option<BatchOutcome> {
        self.core.deliver(batch)
    }
}

impl GraphRunner for SimGraph {
    fn shutdown_handle(&self) -> ShutdownHandle {
        let stop = Arc::clone(&self.stop);
        ShutdownHandle::new(move || stop.store(true, Ordering::Release))
    }

    fn run(self, machine: &mut LifecycleMachine) -> Result<RunOutcome, PipelineError> {
        let (tx, rx) = mpsc::channel();
        for (old, new) in [
            (PipelineState::Null, PipelineState::Ready),
            (PipelineState::Ready, PipelineState::Paused),
            (PipelineState::Paused, PipelineState::Playing),
        ] {
            let _ = tx.send(LifecycleEvent::StateChanged {
                from_top_level: true,
                old,
                new,
            });
        }

        let core = Arc::clone(&self.core);
        let stop = Arc::clone(&self.stop);
        let feed = self.feed.clone();
        let worker = thread::Builder::new()
            .name("sim-delivery".to_string())
            .spawn(move || feed.play(&core, &stop, &tx))
            .map_err(|e| {
                PipelineError::configuration(format!("failed to start delivery thread: {}", e))
            })?;

        let outcome = machine.drive(rx);
        self.stop.store(true, Ordering::Release);
        if worker.join().is_err() {
            log::warn!("delivery thread panicked");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, InputSource, OutputSink};
    use crate::context::RunContext;
    use crate::policy::RedactionPolicy;
    use crate::topology::assemble;
    use std::path::PathBuf;

    fn file_config() -> Configuration {
        Configuration {
            input: InputSource::File(PathBuf::from("stub://clip")),
            output: OutputSink::Display,
            detector_config: PathBuf::from("pgie.txt"),
            annotation_dir: None,
        }
    }

    fn engine() -> RedactionEngine {
        RedactionEngine::new(
            Arc::new(RedactionPolicy::default()),
            Arc::new(RunContext::new()),
        )
    }

    #[test]
    fn decoder_output_links_on_first_video_pad() {
        let settings = PipelineSettings::default();
        let graph =
            assemble(&file_config(), &settings, engine(), SimBackend::for_settings(&settings))
                .unwrap();

        assert!(!graph.entry_linked());
        assert!(graph.deliver(&mut FrameBatch::default()).is_none());

        assert!(!graph.announce_output(&SimPad::audio("src_0")));
        assert!(graph.announce_output(&SimPad::video("src_1")));
        assert!(!graph.announce_output(&SimPad::video("src_2")));
        assert!(graph.entry_linked());
        assert!(graph.deliver(&mut FrameBatch::default()).is_some());
    }

    #[test]
    fn missing_factory_fails_construction() {
        let settings = PipelineSettings::default();
        let backend = SimBackend::for_settings(&settings).without_factory("nvinfer");
        let err = assemble(&file_config(), &settings, engine(), backend)
            .err()
            .unwrap();
        match err {
            PipelineError::StageConstruction { role, factory, .. } => {
                assert_eq!(role, StageRole::Detector);
                assert_eq!(factory, "nvinfer");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn feed_places_one_object_per_label() {
        let feed = SyntheticFeed::new(3, vec!["face".into(), "license_plate".into()]);
        let batch = feed.batch(2);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.frames[0].frame_num, 2);
        let classes: Vec<u32> = batch.frames[0].objects.iter().map(|o| o.class_id).collect();
        assert_eq!(classes, vec![0, 1]);
        let label = batch.frames[0].objects[0].label.as_ref().unwrap();
        assert_eq!(label.font.size, 15);
    }

    #[test]
    fn tiny_frames_do_not_underflow() {
        let mut settings = PipelineSettings::default();
        settings.mux.width = 16;
        settings.mux.height = 8;
        let feed = SyntheticFeed::from_settings(&settings);
        let bbox = feed.batch(7).frames[0].objects[0].bbox;
        assert_eq!(bbox.width, 8);
        assert!(bbox.right() <= 16);
    }

    #[test]
    fn run_plays_the_whole_feed() {
        let settings = PipelineSettings::default();
        let context = Arc::new(RunContext::new());
        let engine = RedactionEngine::new(
            Arc::new(RedactionPolicy::default()),
            Arc::clone(&context),
        );
        let graph = assemble(&file_config(), &settings, engine, SimBackend::for_settings(&settings))
            .unwrap()
            .with_feed(SyntheticFeed::new(12, vec!["face".into()]));

        let mut machine = LifecycleMachine::new(Arc::clone(&context));
        let outcome = graph.run(&mut machine).unwrap();
        match outcome {
            RunOutcome::Completed(report) => assert_eq!(report.frames, 12),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(machine.state(), PipelineState::Playing);
    }

    #[test]
    fn shutdown_before_run_ends_cleanly() {
        let settings = PipelineSettings::default();
        let context = Arc::new(RunContext::new());
        let engine = RedactionEngine::new(
            Arc::new(RedactionPolicy::default()),
            Arc::clone(&context),
        );
        let graph = assemble(&file_config(), &settings, engine, SimBackend::for_settings(&settings))
            .unwrap()
            .with_feed(SyntheticFeed::new(1_000, vec!["face".into()]));
        graph.shutdown_handle().request();

        let mut machine = LifecycleMachine::new(Arc::clone(&context));
        let outcome = graph.run(&mut machine).unwrap();
        assert!(outcome.is_success());
        assert_eq!(context.frame_count(), 0);
    }
}
