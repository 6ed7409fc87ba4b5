//! Face matching against a registry of named reference vectors.
//!
//! Feature-vector extraction is a pluggable capability: the host supplies
//! a [`FaceEncoder`] at construction time, and [`NullEncoder`] stands in
//! when no backend is available — matching then degrades to a no-op
//! (logged once), never a crash. This crate only owns the matching and
//! gating policy around whatever encoder is supplied.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::FaceError;

/// Feature vector produced by an encoder for one detected face.
pub type FaceVector = Vec<f64>;

/// Distance below which an encoding counts as the same person. The scale
/// depends on the encoder's metric; 0.5 suits Euclidean dlib-style
/// embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

/// Pluggable feature-vector extraction backend.
pub trait FaceEncoder: Send + Sync {
    /// Whether the backend can actually encode. A `false` here disables
    /// matching entirely; it is not an error.
    fn available(&self) -> bool;

    /// Extract one vector per face detected in the image. An empty vector
    /// means "no face found"; undecodable bytes are `InvalidImage`.
    fn encode(&self, image: &[u8]) -> Result<Vec<FaceVector>, FaceError>;

    /// Distance between two vectors in the encoder's own metric.
    fn distance(&self, a: &FaceVector, b: &FaceVector) -> f64;
}

/// Null object for an absent recognition backend.
pub struct NullEncoder;

impl FaceEncoder for NullEncoder {
    fn available(&self) -> bool {
        false
    }

    fn encode(&self, _image: &[u8]) -> Result<Vec<FaceVector>, FaceError> {
        Err(FaceError::LibraryUnavailable)
    }

    fn distance(&self, _a: &FaceVector, _b: &FaceVector) -> f64 {
        f64::INFINITY
    }
}

/// Euclidean distance, the metric of dlib-style face embeddings.
pub fn euclidean_distance(a: &FaceVector, b: &FaceVector) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// A named reference vector. The name is the unique key; re-adding an
/// existing name replaces the stored encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownFace {
    pub name: String,
    pub encoding: FaceVector,
}

/// Matches captured frames against the registry of known faces.
pub struct FaceMatcher {
    encoder: Arc<dyn FaceEncoder>,
    faces: RwLock<Vec<KnownFace>>,
    threshold: f64,
    disabled_logged: AtomicBool,
}

impl FaceMatcher {
    pub fn new(encoder: Arc<dyn FaceEncoder>) -> Self {
        Self::with_threshold(encoder, DEFAULT_MATCH_THRESHOLD)
    }

    pub fn with_threshold(encoder: Arc<dyn FaceEncoder>, threshold: f64) -> Self {
        Self {
            encoder,
            faces: RwLock::new(Vec::new()),
            threshold,
            disabled_logged: AtomicBool::new(false),
        }
    }

    /// Whether the underlying encoder can match at all.
    pub fn available(&self) -> bool {
        self.encoder.available()
    }

    /// Replace the registry wholesale (e.g. restored from host storage).
    pub fn load_known_faces(&self, faces: Vec<KnownFace>) {
        let count = faces.len();
        *self.faces.write() = faces;
        if count > 0 {
            tracing::info!(count, "known faces loaded");
        } else {
            tracing::info!("no known faces configured");
        }
    }

    pub fn known_faces(&self) -> Vec<KnownFace> {
        self.faces.read().clone()
    }

    pub fn known_names(&self) -> Vec<String> {
        self.faces.read().iter().map(|f| f.name.clone()).collect()
    }

    /// Register a face by computing the encoding of the submitted image.
    /// Last write wins on duplicate names.
    pub fn add_face(&self, name: &str, image: &[u8]) -> Result<(), FaceError> {
        if !self.encoder.available() {
            return Err(FaceError::LibraryUnavailable);
        }
        if image.is_empty() {
            return Err(FaceError::InvalidImage("empty image".into()));
        }
        let mut encodings = self.encoder.encode(image)?;
        if encodings.is_empty() {
            return Err(FaceError::NoFaceFound);
        }
        let encoding = encodings.swap_remove(0);

        let mut faces = self.faces.write();
        faces.retain(|face| face.name != name);
        faces.push(KnownFace {
            name: name.to_string(),
            encoding,
        });
        tracing::info!(name, total = faces.len(), "known face registered");
        Ok(())
    }

    /// Remove a face by name.
    pub fn remove_face(&self, name: &str) -> Result<(), FaceError> {
        let mut faces = self.faces.write();
        let before = faces.len();
        faces.retain(|face| face.name != name);
        if faces.len() == before {
            return Err(FaceError::UnknownFace(name.to_string()));
        }
        tracing::info!(name, "known face removed");
        Ok(())
    }

    /// Find the best-matching known face in a captured frame.
    ///
    /// Every detected encoding is compared against every reference vector;
    /// the globally closest pair under the threshold wins. Ties keep the
    /// first-registered face. Returns `None` when the backend is
    /// unavailable, the registry is empty, nothing clears the threshold,
    /// or the frame cannot be analyzed (logged, not raised).
    pub fn match_frame(&self, frame: &[u8]) -> Option<String> {
        if !self.encoder.available() {
            if !self.disabled_logged.swap(true, Ordering::Relaxed) {
                tracing::info!("face recognition backend unavailable, matching disabled");
            }
            return None;
        }
        let faces = self.faces.read();
        if faces.is_empty() {
            tracing::debug!("no known faces registered, skipping match");
            return None;
        }
        if frame.is_empty() {
            tracing::debug!("empty frame, skipping match");
            return None;
        }

        let encodings = match self.encoder.encode(frame) {
            Ok(encodings) => encodings,
            Err(err) => {
                tracing::error!(error = %err, "failed to analyze frame");
                return None;
            }
        };

        let mut best: Option<(usize, f64)> = None;
        for encoding in &encodings {
            for (index, known) in faces.iter().enumerate() {
                let distance = self.encoder.distance(&known.encoding, encoding);
                if distance <= self.threshold
                    && best.map_or(true, |(_, best_distance)| distance < best_distance)
                {
                    best = Some((index, distance));
                }
            }
        }

        best.map(|(index, distance)| {
            let name = faces[index].name.clone();
            tracing::debug!(name = %name, distance, "best face match");
            name
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encoder that "detects" one face per input byte, using the byte
    /// value as a one-dimensional embedding.
    struct ByteEncoder;

    impl FaceEncoder for ByteEncoder {
        fn available(&self) -> bool {
            true
        }

        fn encode(&self, image: &[u8]) -> Result<Vec<FaceVector>, FaceError> {
            if image == b"garbage" {
                return Err(FaceError::InvalidImage("not an image".into()));
            }
            Ok(image.iter().map(|b| vec![f64::from(*b)]).collect())
        }

        fn distance(&self, a: &FaceVector, b: &FaceVector) -> f64 {
            euclidean_distance(a, b)
        }
    }

    fn matcher_with(faces: &[(&str, f64)]) -> FaceMatcher {
        let matcher = FaceMatcher::with_threshold(Arc::new(ByteEncoder), 10.0);
        matcher.load_known_faces(
            faces
                .iter()
                .map(|(name, value)| KnownFace {
                    name: (*name).to_string(),
                    encoding: vec![*value],
                })
                .collect(),
        );
        matcher
    }

    #[test]
    fn euclidean_distance_basics() {
        assert_eq!(euclidean_distance(&vec![0.0, 0.0], &vec![3.0, 4.0]), 5.0);
        assert_eq!(euclidean_distance(&vec![1.0], &vec![1.0]), 0.0);
    }

    #[test]
    fn match_below_threshold_returns_name() {
        let matcher = matcher_with(&[("alice", 100.0)]);
        // Distance 5 <= threshold 10.
        assert_eq!(matcher.match_frame(&[105]).as_deref(), Some("alice"));
    }

    #[test]
    fn match_above_threshold_returns_none() {
        let matcher = matcher_with(&[("alice", 100.0)]);
        // Distance 11 > threshold 10.
        assert_eq!(matcher.match_frame(&[111]), None);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let matcher = matcher_with(&[("alice", 100.0)]);
        // Distance exactly 10.
        assert_eq!(matcher.match_frame(&[110]).as_deref(), Some("alice"));
    }

    #[test]
    fn globally_closest_match_wins_across_encodings() {
        let matcher = matcher_with(&[("alice", 100.0), ("bob", 50.0)]);
        // Frame has two faces: 98 (distance 2 to alice) and 49
        // (distance 1 to bob). Bob is globally closest.
        assert_eq!(matcher.match_frame(&[98, 49]).as_deref(), Some("bob"));
    }

    #[test]
    fn tie_keeps_first_registered_face() {
        let matcher = matcher_with(&[("alice", 100.0), ("bob", 100.0)]);
        assert_eq!(matcher.match_frame(&[100]).as_deref(), Some("alice"));
    }

    #[test]
    fn empty_registry_never_matches() {
        let matcher = FaceMatcher::new(Arc::new(ByteEncoder));
        assert_eq!(matcher.match_frame(&[100]), None);
    }

    #[test]
    fn encode_error_yields_none() {
        let matcher = matcher_with(&[("alice", 100.0)]);
        assert_eq!(matcher.match_frame(b"garbage"), None);
    }

    #[test]
    fn null_encoder_disables_matching() {
        let matcher = FaceMatcher::new(Arc::new(NullEncoder));
        matcher.load_known_faces(vec![KnownFace {
            name: "alice".into(),
            encoding: vec![1.0],
        }]);
        assert!(!matcher.available());
        assert_eq!(matcher.match_frame(&[1]), None);
        assert!(matches!(
            matcher.add_face("bob", &[1]),
            Err(FaceError::LibraryUnavailable)
        ));
    }

    #[test]
    fn add_face_registers_first_detected_encoding() {
        let matcher = FaceMatcher::with_threshold(Arc::new(ByteEncoder), 10.0);
        matcher.add_face("alice", &[100, 200]).unwrap();
        let faces = matcher.known_faces();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].encoding, vec![100.0]);
    }

    #[test]
    fn add_face_rejects_faceless_and_empty_images() {
        let matcher = FaceMatcher::new(Arc::new(ByteEncoder));
        assert!(matches!(
            matcher.add_face("alice", &[]),
            Err(FaceError::InvalidImage(_))
        ));
        struct FacelessEncoder;
        impl FaceEncoder for FacelessEncoder {
            fn available(&self) -> bool {
                true
            }
            fn encode(&self, _image: &[u8]) -> Result<Vec<FaceVector>, FaceError> {
                Ok(Vec::new())
            }
            fn distance(&self, a: &FaceVector, b: &FaceVector) -> f64 {
                euclidean_distance(a, b)
            }
        }
        let matcher = FaceMatcher::new(Arc::new(FacelessEncoder));
        assert!(matches!(
            matcher.add_face("alice", &[1]),
            Err(FaceError::NoFaceFound)
        ));
    }

    #[test]
    fn duplicate_add_is_last_write_wins() {
        let matcher = FaceMatcher::with_threshold(Arc::new(ByteEncoder), 10.0);
        matcher.add_face("alice", &[100]).unwrap();
        matcher.add_face("alice", &[200]).unwrap();
        let faces = matcher.known_faces();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].encoding, vec![200.0]);
    }

    #[test]
    fn remove_face_by_name() {
        let matcher = FaceMatcher::with_threshold(Arc::new(ByteEncoder), 10.0);
        matcher.add_face("alice", &[100]).unwrap();
        matcher.remove_face("alice").unwrap();
        assert!(matcher.known_names().is_empty());
        assert!(matches!(
            matcher.remove_face("alice"),
            Err(FaceError::UnknownFace(_))
        ));
    }

    #[test]
    fn known_face_roundtrips_through_serde() {
        let face = KnownFace {
            name: "alice".into(),
            encoding: vec![0.25, -1.5],
        };
        let json = serde_json::to_string(&face).unwrap();
        let parsed: KnownFace = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, face);
    }
}
