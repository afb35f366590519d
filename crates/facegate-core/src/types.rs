use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label reported when no enrolled identity matches a probe.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Score reported for an empty population. Lies below every cosine similarity.
pub const NO_MATCH_SCORE: f32 = -1.0;

/// Bounding box for a detected face, in pixel coordinates of the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Build a box from corner coordinates `(x1, y1)` to `(x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Euclidean distance between the centres of two boxes.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor has no dimensions")]
    Empty,
    #[error("descriptor contains NaN/Inf")]
    NonFinite,
    #[error("descriptor has zero norm")]
    ZeroNorm,
}

/// Unit-normalized face descriptor produced by the extraction collaborator.
///
/// Construction always L2-normalizes, so two descriptors compare by
/// cosine similarity. The vector cannot be mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorRepr")]
pub struct Descriptor {
    values: Vec<f32>,
    model_version: Option<String>,
}

/// Wire form of [`Descriptor`]; deserialized values are normalized again.
#[derive(Deserialize)]
struct DescriptorRepr {
    values: Vec<f32>,
    #[serde(default)]
    model_version: Option<String>,
}

impl TryFrom<DescriptorRepr> for Descriptor {
    type Error = DescriptorError;

    fn try_from(repr: DescriptorRepr) -> Result<Self, Self::Error> {
        let descriptor = Descriptor::new(repr.values)?;
        Ok(match repr.model_version {
            Some(version) => descriptor.with_model_version(version),
            None => descriptor,
        })
    }
}

impl Descriptor {
    /// Normalize `values` to unit length.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite);
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= 0.0 || !norm.is_finite() {
            return Err(DescriptorError::ZeroNorm);
        }

        Ok(Self {
            values: values.into_iter().map(|v| v / norm).collect(),
            model_version: None,
        })
    }

    /// Tag the descriptor with the model that produced it (e.g. "facenet-vggface2").
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Descriptors of different dimension come from different models and
    /// compare as 0.0. Always processes every dimension.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = if denom > 0.0 { dot / denom } else { 0.0 };
        // Rounding can push a self-comparison a hair past 1.0.
        sim.clamp(-1.0, 1.0)
    }
}

/// A person in the enrolled population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub id: String,
    pub name: String,
    pub descriptor: Descriptor,
    pub created_at: String,
}

impl EnrolledIdentity {
    /// New identity with a fresh UUID and the current UTC timestamp.
    pub fn new(name: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            descriptor,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Best match of a probe against a population.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// ID of the best-matching identity; `None` when the population is empty
    /// or the match was rejected.
    pub identity_id: Option<String>,
    pub name: Option<String>,
    /// Cosine similarity of the best candidate, or [`NO_MATCH_SCORE`].
    pub score: f32,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity_id: None,
            name: None,
            score: NO_MATCH_SCORE,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.identity_id.is_none()
    }

    /// Display name, or [`UNKNOWN_IDENTITY`].
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }

    /// Drop the identity but keep the score (rejected below a threshold).
    pub fn into_rejected(self) -> Self {
        Self {
            identity_id: None,
            name: None,
            score: self.score,
        }
    }
}

/// Strategy for comparing a probe descriptor against an enrolled population.
pub trait Matcher {
    fn best_match(&self, probe: &Descriptor, population: &[EnrolledIdentity]) -> MatchResult;
}

/// Cosine similarity matcher with full population traversal.
///
/// Always iterates ALL entries so timing does not leak the match
/// position. Ties keep the first-seen identity.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Descriptor, population: &[EnrolledIdentity]) -> MatchResult {
        let mut best_score = NO_MATCH_SCORE;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in population.iter().enumerate() {
            let score = probe.similarity(&identity.descriptor);
            if best_idx.is_none() || score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) => MatchResult {
                identity_id: Some(population[idx].id.clone()),
                name: Some(population[idx].name.clone()),
                score: best_score,
            },
            None => MatchResult::unknown(),
        }
    }
}

/// Similarity thresholds applied on top of the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// An enrollment whose best existing match exceeds this replaces that record.
    pub enroll_dedup: f32,
    /// A recognition succeeds when the best match exceeds this.
    pub recognize_accept: f32,
    /// Liveness frames must stay at or above this similarity to the session descriptor.
    pub liveness_floor: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            enroll_dedup: 0.85,
            recognize_accept: 0.70,
            liveness_floor: 0.70,
        }
    }
}

impl MatchPolicy {
    pub fn is_duplicate(&self, result: &MatchResult) -> bool {
        !result.is_unknown() && result.score > self.enroll_dedup
    }

    pub fn accepts(&self, result: &MatchResult) -> bool {
        !result.is_unknown() && result.score > self.recognize_accept
    }

    /// Apply the recognition threshold, keeping the score of a rejected match.
    pub fn recognize(&self, result: MatchResult) -> MatchResult {
        if self.accepts(&result) {
            result
        } else {
            result.into_rejected()
        }
    }
}
