use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AnnotationError;

/// Which flank of the animal is visible.
///
/// Upstream classifiers emit compound labels such as `"upleft"` or
/// `"frontright"`; any label containing `left` or `right` maps to that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Viewpoint {
    Left,
    Right,
}

impl Viewpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Viewpoint::Left => "left",
            Viewpoint::Right => "right",
        }
    }
}

impl FromStr for Viewpoint {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let left = lower.contains("left");
        let right = lower.contains("right");
        match (left, right) {
            (true, false) => Ok(Viewpoint::Left),
            (false, true) => Ok(Viewpoint::Right),
            _ => Err(AnnotationError::UnknownViewpoint(s.to_string())),
        }
    }
}

impl TryFrom<String> for Viewpoint {
    type Error = AnnotationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Viewpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPS fix of the frame an annotation came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// A single detected-and-localized animal instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Unique identifier assigned by the detector.
    pub id: String,

    /// Tracking id shared by annotations of the same animal within one
    /// video. Still images carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,

    pub viewpoint: Viewpoint,

    /// Capture time of the frame.
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Key into the embedding set the affinity model was built from.
    pub embedding_ref: String,

    /// Identifiability score in [0, 1].
    pub quality_score: f32,
}

impl Annotation {
    pub(crate) fn validate(&self) -> Result<(), AnnotationError> {
        if self.id.is_empty() {
            return Err(AnnotationError::EmptyId);
        }
        if !(0.0..=1.0).contains(&self.quality_score) {
            return Err(AnnotationError::InvalidQuality {
                id: self.id.clone(),
                score: self.quality_score,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewpoint_from_compound_labels() {
        assert_eq!("left".parse::<Viewpoint>().unwrap(), Viewpoint::Left);
        assert_eq!("upleft".parse::<Viewpoint>().unwrap(), Viewpoint::Left);
        assert_eq!("FrontRight".parse::<Viewpoint>().unwrap(), Viewpoint::Right);
        assert!("front".parse::<Viewpoint>().is_err());
        assert!("leftright".parse::<Viewpoint>().is_err());
    }

    #[test]
    fn annotation_json_shape() {
        let json = r#"{
            "id": "a1",
            "track_id": "t7",
            "viewpoint": "backleft",
            "timestamp": "2024-03-01T10:00:00Z",
            "embedding_ref": "e1",
            "quality_score": 0.8
        }"#;
        let ann: Annotation = serde_json::from_str(json).unwrap();
        assert_eq!(ann.viewpoint, Viewpoint::Left);
        assert_eq!(ann.track_id.as_deref(), Some("t7"));
        assert!(ann.location.is_none());

        let back = serde_json::to_value(&ann).unwrap();
        assert_eq!(back["viewpoint"], "left");
        assert!(back.get("location").is_none());
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        let ann = Annotation {
            id: "a".into(),
            track_id: None,
            viewpoint: Viewpoint::Right,
            timestamp: Utc::now(),
            location: None,
            embedding_ref: "e".into(),
            quality_score: 1.5,
        };
        assert!(matches!(
            ann.validate(),
            Err(AnnotationError::InvalidQuality { .. })
        ));
    }
}
