//! Multi-face tracking across a stream of frames.
//!
//! Each detection in a frame is correlated with a tracked face from the
//! previous frames, and its EAR is routed to that face's blink state.
//! A track whose recognized name changes is reset, so a new person at the
//! same position starts liveness from zero. Tracks that go unmatched for
//! more than `max_lost_frames` consecutive frames are retired.

use serde::{Deserialize, Serialize};

use crate::liveness::{BlinkConfig, BlinkState};
use crate::types::{BoundingBox, MatchResult};

/// How detections are associated with existing tracks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Detection `i` continues the track last seen at index `i`.
    ///
    /// Breaks identity continuity when the detector reorders its output.
    Positional,
    /// Greedy nearest-centre assignment, bounded by `max_center_distance` pixels.
    Spatial { max_center_distance: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// A track is retired once it has been unmatched for more than this many frames.
    pub max_lost_frames: u32,
    pub correlation: Correlation,
    pub blink: BlinkConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_lost_frames: 25,
            correlation: Correlation::Spatial {
                max_center_distance: 120.0,
            },
            blink: BlinkConfig::default(),
        }
    }
}

/// One face in the current frame, as seen by the matcher.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Thresholded match; unknown when nobody was recognized.
    pub identity: MatchResult,
    /// Mean eye aspect ratio, when landmarks were available.
    pub ear: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    /// Nobody recognized; liveness is not evaluated.
    Unknown,
    Live,
    NotYetLive,
}

/// Per-frame report for one detection.
#[derive(Debug, Clone, Serialize)]
pub struct FaceStatus {
    /// Index of the detection in this frame.
    pub slot: usize,
    pub track_id: u64,
    pub name: String,
    pub score: f32,
    pub status: LiveStatus,
    pub blinks: u32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone)]
pub struct TrackedFace {
    pub track_id: u64,
    /// Detection index at which the face was last seen.
    pub slot: usize,
    pub name: String,
    pub live_state: BlinkState,
    pub frames_since_seen: u32,
    pub last_box: BoundingBox,
}

impl TrackedFace {
    fn new(track_id: u64, slot: usize, name: &str, bbox: BoundingBox, blink: BlinkConfig) -> Self {
        Self {
            track_id,
            slot,
            name: name.to_string(),
            live_state: BlinkState::new(blink),
            frames_since_seen: 0,
            last_box: bbox,
        }
    }
}

/// Tracks faces across frames of one stream. Not shared between streams.
#[derive(Debug)]
pub struct FaceTracker {
    config: TrackerConfig,
    tracks: Vec<TrackedFace>,
    next_track_id: u64,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_track_id: 1,
        }
    }

    /// Process one frame's detections (in detector order) and report each face.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<FaceStatus> {
        let assigned = self.correlate(detections);
        let mut seen = vec![false; self.tracks.len()];
        let mut statuses = Vec::with_capacity(detections.len());

        for (slot, det) in detections.iter().enumerate() {
            let name = det.identity.label();

            let idx = match assigned[slot] {
                Some(idx) => idx,
                None => {
                    let track_id = self.next_track_id;
                    self.next_track_id += 1;
                    tracing::debug!(track_id, slot, name, "new track");
                    self.tracks.push(TrackedFace::new(
                        track_id,
                        slot,
                        name,
                        det.bbox,
                        self.config.blink,
                    ));
                    seen.push(false);
                    self.tracks.len() - 1
                }
            };
            seen[idx] = true;

            let track = &mut self.tracks[idx];
            if track.name != name {
                tracing::debug!(
                    track_id = track.track_id,
                    previous = %track.name,
                    current = name,
                    "identity changed at track; liveness reset"
                );
                track.live_state.reset();
                track.name = name.to_string();
            }
            track.slot = slot;
            track.last_box = det.bbox;
            track.frames_since_seen = 0;

            let status = if det.identity.is_unknown() {
                LiveStatus::Unknown
            } else {
                let live = match det.ear {
                    Some(ear) => track.live_state.update(ear),
                    None => track.live_state.is_live(),
                };
                if live {
                    LiveStatus::Live
                } else {
                    LiveStatus::NotYetLive
                }
            };

            statuses.push(FaceStatus {
                slot,
                track_id: track.track_id,
                name: track.name.clone(),
                score: det.identity.score,
                status,
                blinks: track.live_state.blink_count(),
                bbox: det.bbox,
            });
        }

        for (track, seen) in self.tracks.iter_mut().zip(seen.iter()) {
            if !seen {
                track.frames_since_seen += 1;
            }
        }

        let max_lost = self.config.max_lost_frames;
        self.tracks.retain(|t| {
            let keep = t.frames_since_seen <= max_lost;
            if !keep {
                tracing::debug!(track_id = t.track_id, name = %t.name, "track retired");
            }
            keep
        });

        statuses
    }

    /// Map each detection to the index of an existing track, if any.
    fn correlate(&self, detections: &[Detection]) -> Vec<Option<usize>> {
        match self.config.correlation {
            Correlation::Positional => (0..detections.len())
                .map(|slot| self.tracks.iter().position(|t| t.slot == slot))
                .collect(),
            Correlation::Spatial {
                max_center_distance,
            } => {
                let mut candidates = Vec::new();
                for (d, det) in detections.iter().enumerate() {
                    for (t, track) in self.tracks.iter().enumerate() {
                        let dist = det.bbox.center_distance(&track.last_box);
                        if dist <= max_center_distance {
                            candidates.push((dist, d, t));
                        }
                    }
                }
                // Stable sort: equal distances keep detection order
                candidates.sort_by(|a, b| {
                    a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal)
                });

                let mut assigned = vec![None; detections.len()];
                let mut track_taken = vec![false; self.tracks.len()];
                for (_, d, t) in candidates {
                    if assigned[d].is_none() && !track_taken[t] {
                        assigned[d] = Some(t);
                        track_taken[t] = true;
                    }
                }
                assigned
            }
        }
    }

    pub fn tracks(&self) -> &[TrackedFace] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}
