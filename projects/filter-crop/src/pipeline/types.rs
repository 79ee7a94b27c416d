use image::{DynamicImage, GenericImageView};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the frame data object holding stage-visible metadata.
pub const META_KEY: &str = "meta";
/// Metadata flag downstream stages consult before running text recognition.
pub const SKIP_OCR_FLAG: &str = "skip_ocr";
/// Metadata field recording the output key a frame was published under.
pub const TOPIC_FIELD: &str = "topic";
/// Canonical passthrough topic.
pub const MAIN_TOPIC: &str = "main";

/// A single polygon ring in pixel coordinates.
pub type Ring = Vec<(i32, i32)>;

/// Named frames of one pipeline tick, in arrival order.
pub type FrameBatch = IndexMap<String, Frame>;

/// Declared channel order of a frame's pixel buffer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColorLayout {
    #[default]
    Bgr,
    Rgb,
    Gray,
}

impl ColorLayout {
    /// Layout of a freshly decoded image (decoders always produce RGB order).
    pub fn of_decoded(image: &DynamicImage) -> Self {
        if image.color().has_color() {
            ColorLayout::Rgb
        } else {
            ColorLayout::Gray
        }
    }
}

/// Pixel-space rectangle, half-open on the right and bottom edges.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// An image buffer plus its JSON data object.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub layout: ColorLayout,
    pub data: Map<String, Value>,
}

impl Frame {
    /// Builds a frame. Non-object `data` is replaced by an empty object.
    pub fn new(image: DynamicImage, data: Value, layout: ColorLayout) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            image,
            layout,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.image.dimensions().1
    }

    /// `(height, width, channels)`, matching array-shape conventions.
    pub fn shape(&self) -> (u32, u32, u8) {
        let (w, h) = self.image.dimensions();
        (h, w, self.image.color().channel_count())
    }

    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.data.get(META_KEY).and_then(Value::as_object)
    }

    /// Detection records stored under `key`, if that field is a sequence.
    pub fn detections(&self, key: &str) -> Option<&[Value]> {
        self.meta()
            .and_then(|meta| meta.get(key))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    /// New frame with `image` and a deep copy of this frame's data.
    pub fn derive(&self, image: DynamicImage) -> Frame {
        Frame {
            image,
            layout: self.layout,
            data: self.data.clone(),
        }
    }

    /// Marks the frame for OCR and records the key it is published under.
    pub fn stamp(&mut self, topic: &str) {
        let mut meta = match self.data.remove(META_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        meta.insert(SKIP_OCR_FLAG.to_string(), Value::Bool(false));
        meta.insert(TOPIC_FIELD.to_string(), Value::String(topic.to_string()));
        self.data.insert(META_KEY.to_string(), Value::Object(meta));
    }
}
