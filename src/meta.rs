//! Detection metadata model.
//!
//! These are the value types the detector stage hands to the redaction engine:
//! - `DetectionRecord`: one object, its box and the draw attributes the engine mutates
//! - `FrameRecord`: the ordered detections of one frame of one stream
//! - `FrameBatch`: the frames delivered together in one engine invocation
//!
//! Records are owned by the batch for the duration of a single callback. Nothing
//! in this module is retained by the engine once the callback returns.

use serde::{Deserialize, Serialize};

/// Frames per batch when the multiplexer is left at its defaults.
pub const DEFAULT_BATCH_SIZE: u32 = 1;

/// Font used for detector-provided labels.
pub const DEFAULT_FONT_NAME: &str = "Arial";

/// Label font size applied by the draw stage when nothing else is set.
pub const DEFAULT_FONT_SIZE: u32 = 10;

/// Normalized RGBA color (each component in `0.0..=1.0`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Rgba = Rgba::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(red: f64, green: f64, blue: f64, alpha: f64) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// True when every component lies in `0.0..=1.0`.
    pub fn is_normalized(&self) -> bool {
        [self.red, self.green, self.blue, self.alpha]
            .iter()
            .all(|c| (0.0..=1.0).contains(c))
    }
}

impl From<[f64; 4]> for Rgba {
    fn from(c: [f64; 4]) -> Self {
        Rgba::new(c[0], c[1], c[2], c[3])
    }
}

/// Axis-aligned box in pixel units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }
}

/// Box outline and fill as the draw stage renders it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RectStyle {
    pub border_width: u32,
    pub border_color: Rgba,
    pub has_bg_color: bool,
    pub bg_color: Rgba,
}

impl Default for RectStyle {
    fn default() -> Self {
        Self {
            border_width: 3,
            border_color: Rgba::new(1.0, 0.0, 0.0, 1.0),
            has_bg_color: false,
            bg_color: Rgba::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FontParams {
    pub name: String,
    pub size: u32,
    pub color: Rgba,
}

impl Default for FontParams {
    fn default() -> Self {
        Self {
            name: DEFAULT_FONT_NAME.to_string(),
            size: DEFAULT_FONT_SIZE,
            color: Rgba::WHITE,
        }
    }
}

/// Text drawn next to a box.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayLabel {
    pub text: String,
    pub x_offset: u32,
    pub y_offset: u32,
    pub font: FontParams,
    pub set_bg_clr: bool,
    pub bg_color: Rgba,
}

impl DisplayLabel {
    /// Label placed just above the box, white on black.
    pub fn above(text: impl Into<String>, bbox: &BoundingBox) -> Self {
        Self {
            text: text.into(),
            x_offset: bbox.left,
            y_offset: bbox.top.saturating_sub(25),
            font: FontParams::default(),
            set_bg_clr: true,
            bg_color: Rgba::BLACK,
        }
    }
}

/// One detected object in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub class_id: u32,
    pub bbox: BoundingBox,
    pub label: Option<DisplayLabel>,
    pub tracking_id: Option<u64>,
    pub confidence: f32,
    pub style: RectStyle,
}

impl DetectionRecord {
    pub fn new(class_id: u32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            bbox,
            label: None,
            tracking_id: None,
            confidence: 0.0,
            style: RectStyle::default(),
        }
    }

    /// Attach a display label positioned above the box.
    pub fn with_label(mut self, text: impl Into<String>) -> Self {
        self.label = Some(DisplayLabel::above(text, &self.bbox));
        self
    }

    /// Set the label font size; no-op for unlabeled records.
    pub fn with_font_size(mut self, size: u32) -> Self {
        if let Some(label) = self.label.as_mut() {
            label.font.size = size;
        }
        self
    }

    pub fn with_tracking_id(mut self, id: u64) -> Self {
        self.tracking_id = Some(id);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Detections of one frame, in detector emission order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameRecord {
    pub frame_num: u64,
    pub source_id: u32,
    pub objects: Vec<DetectionRecord>,
}

impl FrameRecord {
    pub fn new(frame_num: u64, source_id: u32) -> Self {
        Self {
            frame_num,
            source_id,
            objects: Vec::new(),
        }
    }

    pub fn with_objects(mut self, objects: Vec<DetectionRecord>) -> Self {
        self.objects = objects;
        self
    }
}

/// Frames delivered together, one per source stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameBatch {
    pub frames: Vec<FrameRecord>,
}

impl FrameBatch {
    pub fn new(frames: Vec<FrameRecord>) -> Self {
        Self { frames }
    }

    /// Batch holding a single frame (the default batch size).
    pub fn single(frame: FrameRecord) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total detections across all frames.
    pub fn object_count(&self) -> usize {
        self.frames.iter().map(|f| f.objects.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_edges() {
        let bbox = BoundingBox::new(10, 20, 30, 40);
        assert_eq!(bbox.right(), 40);
        assert_eq!(bbox.bottom(), 60);
    }

    #[test]
    fn bounding_box_edges_saturate() {
        let bbox = BoundingBox::new(u32::MAX - 1, 0, 10, 0);
        assert_eq!(bbox.right(), u32::MAX);
    }

    #[test]
    fn label_sits_above_box() {
        let record = DetectionRecord::new(3, BoundingBox::new(50, 10, 20, 20)).with_label("face");
        let label = record.label.expect("label");
        assert_eq!(label.x_offset, 50);
        assert_eq!(label.y_offset, 0);
        assert!(label.set_bg_clr);
        assert_eq!(label.font.size, DEFAULT_FONT_SIZE);
    }

    #[test]
    fn batch_counts_objects_across_frames() {
        let frame = |n| {
            FrameRecord::new(n, 0).with_objects(vec![
                DetectionRecord::new(0, BoundingBox::default()),
                DetectionRecord::new(1, BoundingBox::default()),
            ])
        };
        let batch = FrameBatch::new(vec![frame(0), frame(1)]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.object_count(), 4);
    }

    #[test]
    fn rgba_normalization() {
        assert!(Rgba::new(0.92, 0.75, 0.56, 1.0).is_normalized());
        assert!(!Rgba::new(1.5, 0.0, 0.0, 1.0).is_normalized());
    }
}
