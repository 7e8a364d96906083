//! Metadata redaction engine.
//!
//! The engine runs once per delivered batch, on the delivery thread, before the
//! batch reaches the draw stage. It rewrites draw attributes in place according
//! to the redaction policy and optionally exports one annotation file per frame.
//!
//! The engine never fails the surrounding graph: redaction only assigns fixed
//! values to in-memory fields, and annotation I/O problems are scoped to the
//! frame they occur in.

pub mod kitti;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::RunContext;
use crate::meta::{DetectionRecord, FrameBatch, FrameRecord};
use crate::policy::{RedactionPolicy, Treatment};

pub use kitti::{annotation_path, format_line, AnnotationSink};

/// What one engine invocation did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Counter value the batch was recorded under.
    pub batch_index: u64,
    /// Records that received a suppress treatment.
    pub suppressed: usize,
    /// Annotation files successfully written for this batch.
    pub annotation_files: usize,
}

/// Apply `treatment` to a single record.
///
/// Applying the same treatment twice leaves the record as after the first pass.
pub fn apply_treatment(record: &mut DetectionRecord, treatment: Treatment) -> bool {
    match treatment {
        Treatment::Passthrough => false,
        Treatment::Suppress { fill } => {
            record.style.border_width = 0;
            record.style.has_bg_color = true;
            record.style.bg_color = fill;
            if let Some(label) = record.label.as_mut() {
                label.set_bg_clr = false;
                label.font.size = 0;
            }
            true
        }
    }
}

/// Per-batch redaction callback.
#[derive(Clone, Debug)]
pub struct RedactionEngine {
    policy: Arc<RedactionPolicy>,
    context: Arc<RunContext>,
    annotation_dir: Option<PathBuf>,
}

impl RedactionEngine {
    pub fn new(policy: Arc<RedactionPolicy>, context: Arc<RunContext>) -> Self {
        Self {
            policy,
            context,
            annotation_dir: None,
        }
    }

    /// Export annotations under `dir`; `None` disables export.
    pub fn with_annotation_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.annotation_dir = dir;
        self
    }

    pub fn annotation_dir(&self) -> Option<&Path> {
        self.annotation_dir.as_deref()
    }

    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Redact every frame of `batch` in delivery order and count the batch once.
    ///
    /// The batch index is claimed with a single atomic increment up front, so
    /// concurrent callers never share an index or an annotation file.
    pub fn process_batch(&self, batch: &mut FrameBatch) -> BatchOutcome {
        let batch_index = self.context.record_batch();
        let mut outcome = BatchOutcome {
            batch_index,
            ..BatchOutcome::default()
        };

        for frame in batch.frames.iter_mut() {
            let (suppressed, exported) = self.process_frame(frame, batch_index);
            outcome.suppressed += suppressed;
            if exported {
                outcome.annotation_files += 1;
            }
        }

        log::trace!(
            "batch {}: {} frame(s), {} suppressed",
            batch_index,
            batch.len(),
            outcome.suppressed
        );
        outcome
    }

    fn process_frame(&self, frame: &mut FrameRecord, index: u64) -> (usize, bool) {
        let mut sink = self.open_sink(index);
        let mut suppressed = 0;

        for record in frame.objects.iter_mut() {
            let treatment = self.policy.treatment_for(record.class_id);
            if apply_treatment(record, treatment) {
                suppressed += 1;
            }
            if let Some(sink) = sink.as_mut() {
                sink.append(record);
            }
        }

        let exported = match sink.take() {
            Some(sink) => {
                let path = sink.path().to_path_buf();
                match sink.finish() {
                    Ok(()) => true,
                    Err(e) => {
                        log::debug!("annotation flush to {} failed: {}", path.display(), e);
                        false
                    }
                }
            }
            None => false,
        };
        (suppressed, exported)
    }

    fn open_sink(&self, index: u64) -> Option<AnnotationSink> {
        let dir = self.annotation_dir.as_deref()?;
        match AnnotationSink::open(dir, index) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::debug!(
                    "skipping annotation for frame {} under {}: {}",
                    index,
                    dir.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BoundingBox, Rgba};

    fn engine() -> RedactionEngine {
        RedactionEngine::new(
            Arc::new(RedactionPolicy::default()),
            Arc::new(RunContext::new()),
        )
    }

    fn frame_with(classes: &[u32]) -> FrameRecord {
        let objects = classes
            .iter()
            .enumerate()
            .map(|(i, &class_id)| {
                DetectionRecord::new(class_id, BoundingBox::new(i as u32 * 10, 5, 8, 8))
                    .with_label(format!("class{}", class_id))
            })
            .collect();
        FrameRecord::new(0, 0).with_objects(objects)
    }

    #[test]
    fn class_zero_gets_skin_fill() {
        let engine = engine();
        let mut batch = FrameBatch::single(frame_with(&[0]));
        engine.process_batch(&mut batch);

        let record = &batch.frames[0].objects[0];
        assert_eq!(record.style.border_width, 0);
        assert!(record.style.has_bg_color);
        assert_eq!(record.style.bg_color, Rgba::new(0.92, 0.75, 0.56, 1.0));
        let label = record.label.as_ref().unwrap();
        assert!(!label.set_bg_clr);
        assert_eq!(label.font.size, 0);
    }

    #[test]
    fn class_one_gets_black_fill() {
        let engine = engine();
        let mut batch = FrameBatch::single(frame_with(&[1]));
        engine.process_batch(&mut batch);

        let record = &batch.frames[0].objects[0];
        assert_eq!(record.style.border_width, 0);
        assert_eq!(record.style.bg_color, Rgba::new(0.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn other_classes_pass_through_unchanged() {
        let engine = engine();
        let original = frame_with(&[2, 3, 17]);
        let mut batch = FrameBatch::single(original.clone());
        let outcome = engine.process_batch(&mut batch);

        assert_eq!(batch.frames[0], original);
        assert_eq!(outcome.suppressed, 0);
    }

    #[test]
    fn order_is_preserved() {
        let engine = engine();
        let mut batch = FrameBatch::single(frame_with(&[5, 0, 9, 1]));
        engine.process_batch(&mut batch);

        let classes: Vec<u32> = batch.frames[0].objects.iter().map(|o| o.class_id).collect();
        assert_eq!(classes, vec![5, 0, 9, 1]);
    }

    #[test]
    fn reapplying_policy_is_idempotent() {
        let engine = engine();
        let mut batch = FrameBatch::single(frame_with(&[0, 1, 2]));
        engine.process_batch(&mut batch);
        let once = batch.clone();
        engine.process_batch(&mut batch);
        assert_eq!(batch, once);
    }

    #[test]
    fn counter_advances_once_per_batch() {
        let engine = engine();
        for _ in 0..4 {
            let mut batch = FrameBatch::new(vec![frame_with(&[0]), frame_with(&[1]), frame_with(&[])]);
            engine.process_batch(&mut batch);
        }
        assert_eq!(engine.context().frame_count(), 4);
    }

    #[test]
    fn outcome_reports_batch_index_and_suppressions() {
        let engine = engine();
        let first = engine.process_batch(&mut FrameBatch::single(frame_with(&[0, 1, 4])));
        let second = engine.process_batch(&mut FrameBatch::single(frame_with(&[])));
        assert_eq!(first.batch_index, 0);
        assert_eq!(first.suppressed, 2);
        assert_eq!(second.batch_index, 1);
        assert_eq!(second.annotation_files, 0);
    }

    #[test]
    fn unwritable_annotation_dir_does_not_stop_redaction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine().with_annotation_dir(Some(dir.path().join("missing")));
        let mut batch = FrameBatch::single(frame_with(&[0]));
        let outcome = engine.process_batch(&mut batch);

        assert_eq!(outcome.annotation_files, 0);
        assert_eq!(outcome.suppressed, 1);
        assert!(batch.frames[0].objects[0].style.has_bg_color);
        assert_eq!(engine.context().frame_count(), 1);
    }

    #[test]
    fn custom_policy_drives_treatment() {
        let policy = RedactionPolicy::from_rules([(
            9,
            Treatment::Suppress {
                fill: Rgba::new(0.5, 0.5, 0.5, 1.0),
            },
        )]);
        let engine = RedactionEngine::new(Arc::new(policy), Arc::new(RunContext::new()));
        let mut batch = FrameBatch::single(frame_with(&[0, 9]));
        engine.process_batch(&mut batch);

        assert!(!batch.frames[0].objects[0].style.has_bg_color);
        assert_eq!(
            batch.frames[0].objects[1].style.bg_color,
            Rgba::new(0.5, 0.5, 0.5, 1.0)
        );
    }
}
