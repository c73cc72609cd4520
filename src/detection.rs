//! Face detections returned by the recognition service.

use serde::Deserialize;

use crate::error::{DetectionError, RecognitionError};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Pixel-space face box. Always non-empty: `x_min < x_max` and `y_min < y_max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    x_min: i32,
    y_min: i32,
    x_max: i32,
    y_max: i32,
}

impl BoundingBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Result<Self, DetectionError> {
        if x_min >= x_max || y_min >= y_max {
            return Err(DetectionError::InvalidBox {
                x_min,
                y_min,
                x_max,
                y_max,
            });
        }
        Ok(Self {
            x_min,
            y_min,
            x_max,
            y_max,
        })
    }

    pub fn x_min(&self) -> i32 {
        self.x_min
    }

    pub fn y_min(&self) -> i32 {
        self.y_min
    }

    pub fn x_max(&self) -> i32 {
        self.x_max
    }

    pub fn y_max(&self) -> i32 {
        self.y_max
    }

    pub fn width(&self) -> u32 {
        (self.x_max - self.x_min) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y_max - self.y_min) as u32
    }
}

/// Estimated age range, `low <= high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgeRange {
    pub low: u32,
    pub high: u32,
}

impl AgeRange {
    pub fn new(low: u32, high: u32) -> Result<Self, DetectionError> {
        if low > high {
            return Err(DetectionError::InvalidAgeRange { low, high });
        }
        Ok(Self { low, high })
    }
}

/// Minimum similarity a match must strictly exceed. Always in `(0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct SimilarityThreshold(f64);

impl SimilarityThreshold {
    pub fn new(value: f64) -> Result<Self, DetectionError> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(DetectionError::InvalidThreshold(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for SimilarityThreshold {
    fn default() -> Self {
        Self(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

/// One detected face. Built once per response and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    bbox: BoundingBox,
    age: Option<AgeRange>,
    sex: Option<String>,
    subject: Option<String>,
    similarity: Option<f64>,
}

impl Detection {
    pub fn unmatched(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            age: None,
            sex: None,
            subject: None,
            similarity: None,
        }
    }

    /// A face the service attributed to `subject`. `similarity` must be in `[0, 1]`.
    pub fn with_match(
        bbox: BoundingBox,
        subject: impl Into<String>,
        similarity: f64,
    ) -> Result<Self, DetectionError> {
        if !(0.0..=1.0).contains(&similarity) {
            return Err(DetectionError::InvalidSimilarity(similarity));
        }
        Ok(Self {
            subject: Some(subject.into()),
            similarity: Some(similarity),
            ..Self::unmatched(bbox)
        })
    }

    pub fn with_age(mut self, age: AgeRange) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_sex(mut self, sex: impl Into<String>) -> Self {
        self.sex = Some(sex.into());
        self
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn age(&self) -> Option<AgeRange> {
        self.age
    }

    pub fn sex(&self) -> Option<&str> {
        self.sex.as_deref()
    }

    /// Best-matching subject name as registered with the service.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Similarity of [`Self::subject`], in `[0, 1]`.
    pub fn similarity(&self) -> Option<f64> {
        self.similarity
    }

    /// A detection matches when it names a subject whose similarity is
    /// strictly above `threshold`.
    pub fn is_matching(&self, threshold: SimilarityThreshold) -> bool {
        match (&self.subject, self.similarity) {
            (Some(_), Some(similarity)) => similarity > threshold.value(),
            _ => false,
        }
    }

    /// The subject name, only when the detection is matching.
    pub fn matched_subject(&self, threshold: SimilarityThreshold) -> Option<&str> {
        if self.is_matching(threshold) {
            self.subject.as_deref()
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RecognizeResponse {
    /// Faces stay untyped here so one malformed face cannot fail the whole body.
    #[serde(default)]
    pub result: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct RawFace {
    #[serde(rename = "box", default)]
    pub bbox: Option<RawBox>,
    #[serde(default)]
    pub age: Option<RawAge>,
    #[serde(default)]
    pub gender: Option<RawGender>,
    #[serde(default)]
    pub subjects: Option<Vec<RawSubject>>,
}

#[derive(Debug, Deserialize)]
pub struct RawBox {
    pub x_min: Option<i32>,
    pub y_min: Option<i32>,
    pub x_max: Option<i32>,
    pub y_max: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RawAge {
    pub low: Option<u32>,
    pub high: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RawGender {
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawSubject {
    pub subject: Option<String>,
    pub similarity: Option<f64>,
}

impl RecognizeResponse {
    /// Convert the raw faces, dropping any face that is malformed or has no
    /// usable box.
    pub fn into_detections(self) -> Vec<Detection> {
        self.result
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<RawFace>(value) {
                Ok(face) => face.into_detection(),
                Err(err) => {
                    log::debug!("dropping malformed face: {}", err);
                    None
                }
            })
            .collect()
    }
}

impl RawBox {
    fn corners(&self) -> Option<(i32, i32, i32, i32)> {
        Some((self.x_min?, self.y_min?, self.x_max?, self.y_max?))
    }
}

impl RawFace {
    fn into_detection(self) -> Option<Detection> {
        let Some((x_min, y_min, x_max, y_max)) = self.bbox.as_ref().and_then(RawBox::corners)
        else {
            log::debug!("dropping face without a complete bounding box");
            return None;
        };
        let bbox = match BoundingBox::new(x_min, y_min, x_max, y_max) {
            Ok(bbox) => bbox,
            Err(err) => {
                log::debug!("dropping face: {}", err);
                return None;
            }
        };
        let mut detection = Detection::unmatched(bbox);

        let best = self.subjects.and_then(|subjects| subjects.into_iter().next());
        if let Some(RawSubject {
            subject: Some(subject),
            similarity: Some(similarity),
        }) = best
        {
            match Detection::with_match(bbox, subject.as_str(), similarity) {
                Ok(matched) => detection = matched,
                Err(err) => log::debug!("ignoring subject '{}': {}", subject, err),
            }
        }
        if let Some(age) = self.age.and_then(|age| match (age.low, age.high) {
            (Some(low), Some(high)) => AgeRange::new(low, high).ok(),
            _ => None,
        }) {
            detection = detection.with_age(age);
        }
        if let Some(sex) = self.gender.and_then(|gender| gender.value) {
            detection = detection.with_sex(sex);
        }
        Some(detection)
    }
}

/// Parse a recognition response body.
pub fn parse_response(body: &str) -> Result<Vec<Detection>, RecognitionError> {
    let response: RecognizeResponse =
        serde_json::from_str(body).map_err(|e| RecognitionError::decode(e.to_string()))?;
    Ok(response.into_detections())
}
