//! Per-frame bounding-box export in KITTI object-label layout.
//!
//! One file per frame, one line per object:
//!
//! ```text
//! <label> 0.0 0 0.0 <left>.00 <top>.00 <right>.00 <bottom>.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0
//! ```
//!
//! Only the label and the 2D box carry information; truncation, occlusion,
//! alpha and the 3D fields are fixed placeholders.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::meta::{BoundingBox, DetectionRecord};

const LEADING_PLACEHOLDERS: &str = "0.0 0 0.0";
const TRAILING_PLACEHOLDERS: &str = "0.0 0.0 0.0 0.0 0.0 0.0 0.0";

/// Path of the annotation file for a frame index: `<dir>/%06d.txt`.
pub fn annotation_path(dir: &Path, frame_index: u64) -> PathBuf {
    dir.join(format!("{:06}.txt", frame_index))
}

/// Label token for a record: its display text, or the class id when unlabeled.
///
/// Whitespace would split the token, so it is trimmed and inner runs become `_`.
pub fn label_token(record: &DetectionRecord) -> String {
    let text = record
        .label
        .as_ref()
        .map(|label| label.text.split_whitespace().collect::<Vec<_>>().join("_"))
        .unwrap_or_default();
    if text.is_empty() {
        record.class_id.to_string()
    } else {
        text
    }
}

/// One annotation line, newline-terminated.
pub fn format_line(label: &str, bbox: &BoundingBox) -> String {
    format!(
        "{} {} {}.00 {}.00 {}.00 {}.00 {}\n",
        label,
        LEADING_PLACEHOLDERS,
        bbox.left,
        bbox.top,
        bbox.right(),
        bbox.bottom(),
        TRAILING_PLACEHOLDERS
    )
}

/// Open annotation file for a single frame.
///
/// The file is flushed and closed when the sink is finished or dropped, so it
/// never outlives the frame it was opened for.
pub struct AnnotationSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    lines: usize,
}

impl AnnotationSink {
    /// Create (or truncate) the file for `frame_index` under `dir`.
    pub fn open(dir: &Path, frame_index: u64) -> io::Result<Self> {
        let path = annotation_path(dir, frame_index);
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            lines: 0,
        })
    }

    /// Append the line for `record`.
    ///
    /// After the first failed write the sink goes quiet for the rest of the frame.
    pub fn append(&mut self, record: &DetectionRecord) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = format_line(&label_token(record), &record.bbox);
        match writer.write_all(line.as_bytes()) {
            Ok(()) => self.lines += 1,
            Err(e) => {
                log::debug!("annotation write to {} failed: {}", self.path.display(), e);
                self.writer = None;
            }
        }
    }

    pub fn lines_written(&self) -> usize {
        self.lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BoundingBox, DetectionRecord};

    #[test]
    fn line_matches_kitti_layout() {
        let line = format_line("face", &BoundingBox::new(10, 20, 30, 40));
        assert_eq!(
            line,
            "face 0.0 0 0.0 10.00 20.00 40.00 60.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n"
        );
    }

    #[test]
    fn path_is_zero_padded() {
        let path = annotation_path(Path::new("/tmp/kitti"), 42);
        assert_eq!(path, PathBuf::from("/tmp/kitti/000042.txt"));
    }

    #[test]
    fn label_token_normalizes_whitespace() {
        let record = DetectionRecord::new(1, BoundingBox::default()).with_label(" license plate ");
        assert_eq!(label_token(&record), "license_plate");
    }

    #[test]
    fn unlabeled_record_uses_class_id() {
        let record = DetectionRecord::new(7, BoundingBox::default());
        assert_eq!(label_token(&record), "7");

        let blank = DetectionRecord::new(8, BoundingBox::default()).with_label("   ");
        assert_eq!(label_token(&blank), "8");
    }

    #[test]
    fn sink_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = AnnotationSink::open(dir.path(), 3).unwrap();
        sink.append(&DetectionRecord::new(0, BoundingBox::new(1, 2, 3, 4)).with_label("face"));
        sink.append(&DetectionRecord::new(1, BoundingBox::new(5, 6, 7, 8)).with_label("plate"));
        assert_eq!(sink.lines_written(), 2);
        let path = sink.path().to_path_buf();
        sink.finish().unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            contents,
            "face 0.0 0 0.0 1.00 2.00 4.00 6.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n\
             plate 0.0 0 0.0 5.00 6.00 12.00 14.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n"
        );
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(AnnotationSink::open(&missing, 0).is_err());
    }
}
