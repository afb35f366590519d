//! Active liveness detection via blink counting.
//!
//! A printed photograph or a still image on a screen cannot close its eyes.
//! For each tracked entity we compute the eye aspect ratio (EAR) from six
//! face-mesh landmarks per eye, debounce closures over consecutive frames,
//! and keep a fixed-capacity window of recent blink events. The entity is
//! considered live while the window holds at least `min_blinks` events.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images held in front of camera.
//! - **Does not block:** Video replay of a blinking face, 3D masks with
//!   moving eyelids.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Face-mesh indices of the left eye, ordered p0..p5 for the EAR formula.
pub const LEFT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];
/// Face-mesh indices of the right eye, ordered p0..p5 for the EAR formula.
pub const RIGHT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];

/// Landmark point in normalized [0, 1] image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Dense facial landmarks for one face (468-point mesh convention).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceMesh {
    pub points: Vec<Point>,
}

impl FaceMesh {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Eye aspect ratio for one eye:
    ///
    /// ```text
    /// EAR = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
    /// ```
    ///
    /// Points are scaled to pixels and truncated to whole pixels first.
    /// Returns `None` if an index is missing or the eye has zero width.
    pub fn eye_aspect_ratio(&self, eye: &[usize; 6], width: u32, height: u32) -> Option<f32> {
        let mut px = [(0.0f32, 0.0f32); 6];
        for (slot, &idx) in px.iter_mut().zip(eye.iter()) {
            let p = self.points.get(idx)?;
            *slot = (
                (p.x * width as f32).trunc(),
                (p.y * height as f32).trunc(),
            );
        }

        let vertical_a = distance(px[1], px[5]);
        let vertical_b = distance(px[2], px[4]);
        let horizontal = distance(px[0], px[3]);
        if horizontal <= 0.0 {
            return None;
        }

        Some((vertical_a + vertical_b) / (2.0 * horizontal))
    }

    /// Mean EAR of both eyes.
    pub fn mean_eye_aspect_ratio(&self, width: u32, height: u32) -> Option<f32> {
        let left = self.eye_aspect_ratio(&LEFT_EYE, width, height)?;
        let right = self.eye_aspect_ratio(&RIGHT_EYE, width, height)?;
        Some((left + right) / 2.0)
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Blink detector parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// EAR below this counts as a closed-eye frame.
    pub ear_threshold: f32,
    /// Minimum consecutive closed frames for a closure to count as a blink.
    pub consec_frames: u32,
    /// Capacity of the recent-events window.
    pub window_size: usize,
    /// Blink events required in the window for a live verdict.
    pub min_blinks: u32,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            ear_threshold: 0.21,
            consec_frames: 2,
            window_size: 30,
            min_blinks: 1,
        }
    }
}

/// Fixed-capacity ring of recent closure outcomes (`true` = blink).
///
/// Pushing into a full window evicts the oldest entry. The blink count is
/// maintained incrementally.
#[derive(Debug, Clone)]
pub struct BlinkWindow {
    events: VecDeque<bool>,
    capacity: usize,
    blinks: u32,
}

impl BlinkWindow {
    /// A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            blinks: 0,
        }
    }

    pub fn push(&mut self, blink: bool) {
        if self.events.len() == self.capacity {
            if let Some(true) = self.events.pop_front() {
                self.blinks -= 1;
            }
        }
        self.events.push_back(blink);
        if blink {
            self.blinks += 1;
        }
    }

    pub fn blinks(&self) -> u32 {
        self.blinks
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.blinks = 0;
    }
}

/// Blink state machine for one tracked face or one session.
///
/// `update` must be called at most once per frame for a given entity.
#[derive(Debug, Clone)]
pub struct BlinkState {
    config: BlinkConfig,
    closed_frames: u32,
    window: BlinkWindow,
}

impl BlinkState {
    /// `consec_frames` and `min_blinks` below 1 are raised to 1; a zero
    /// would pass frames that never blinked.
    pub fn new(config: BlinkConfig) -> Self {
        let config = BlinkConfig {
            consec_frames: config.consec_frames.max(1),
            min_blinks: config.min_blinks.max(1),
            ..config
        };
        Self {
            config,
            closed_frames: 0,
            window: BlinkWindow::new(config.window_size),
        }
    }

    /// Feed one frame's EAR and return the rolling verdict.
    ///
    /// A closed frame only extends the current closure. The closure is
    /// recorded when the eye reopens: as a blink if it lasted at least
    /// `consec_frames`, otherwise as a non-event.
    pub fn update(&mut self, ear: f32) -> bool {
        if ear < self.config.ear_threshold {
            self.closed_frames += 1;
        } else {
            let blink = self.closed_frames >= self.config.consec_frames;
            self.window.push(blink);
            if blink {
                tracing::debug!(
                    closed_frames = self.closed_frames,
                    blinks = self.window.blinks(),
                    "blink recorded"
                );
            }
            self.closed_frames = 0;
        }

        self.is_live()
    }

    /// Compute the EAR from `mesh` and feed it. `None` when the mesh yields no EAR.
    pub fn update_mesh(&mut self, mesh: &FaceMesh, width: u32, height: u32) -> Option<bool> {
        let ear = mesh.mean_eye_aspect_ratio(width, height)?;
        Some(self.update(ear))
    }

    pub fn is_live(&self) -> bool {
        self.window.blinks() >= self.config.min_blinks
    }

    pub fn blink_count(&self) -> u32 {
        self.window.blinks()
    }

    pub fn closed_frames(&self) -> u32 {
        self.closed_frames
    }

    pub fn window(&self) -> &BlinkWindow {
        &self.window
    }

    pub fn config(&self) -> &BlinkConfig {
        &self.config
    }

    /// Clear counters and history (new identity at this position).
    pub fn reset(&mut self) {
        self.closed_frames = 0;
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a mesh whose eyes have the given vertical/horizontal extents in pixels
    /// on a 1000x1000 frame.
    fn mesh_with_eyes(open_px: f32, width_px: f32) -> FaceMesh {
        mesh_on_frame(open_px, width_px, 1000, 1000)
    }

    fn mesh_on_frame(open_px: f32, width_px: f32, frame_w: u32, frame_h: u32) -> FaceMesh {
        let (fw, fh) = (frame_w as f32, frame_h as f32);
        let mut points = vec![Point { x: 0.0, y: 0.0 }; 468];
        for (eye, cx) in [(LEFT_EYE, (0.3 * fw).round()), (RIGHT_EYE, (0.7 * fw).round())] {
            let cy = (0.4 * fh).round();
            let half_w = width_px / 2.0;
            let half_h = open_px / 2.0;
            let coords = [
                (cx - half_w, cy),                  // p0 outer corner
                (cx - half_w / 3.0, cy - half_h),   // p1 upper
                (cx + half_w / 3.0, cy - half_h),   // p2 upper
                (cx + half_w, cy),                  // p3 inner corner
                (cx + half_w / 3.0, cy + half_h),   // p4 lower
                (cx - half_w / 3.0, cy + half_h),   // p5 lower
            ];
            // Half-pixel offset keeps truncation away from float rounding edges
            for (&idx, (x, y)) in eye.iter().zip(coords) {
                points[idx] = Point {
                    x: (x + 0.5) / fw,
                    y: (y + 0.5) / fh,
                };
            }
        }
        FaceMesh::new(points)
    }

    fn feed(state: &mut BlinkState, ears: &[f32]) -> bool {
        let mut live = false;
        for &ear in ears {
            live = state.update(ear);
        }
        live
    }

    #[test]
    fn test_ear_geometry() {
        // vertical 30 px, horizontal 100 px → (30 + 30) / 200 = 0.3
        let mesh = mesh_with_eyes(30.0, 100.0);
        let ear = mesh.eye_aspect_ratio(&LEFT_EYE, 1000, 1000).unwrap();
        assert!((ear - 0.3).abs() < 1e-3, "got {ear}");
        let mean = mesh.mean_eye_aspect_ratio(1000, 1000).unwrap();
        assert!((mean - 0.3).abs() < 1e-3, "got {mean}");
    }

    #[test]
    fn test_ear_non_square_frame() {
        // x scales by width and y by height; swapping them gives 80 / 150
        let mesh = mesh_on_frame(30.0, 100.0, 640, 480);
        let ear = mesh.mean_eye_aspect_ratio(640, 480).unwrap();
        assert!((ear - 0.3).abs() < 1e-3, "got {ear}");

        let portrait = mesh_on_frame(30.0, 100.0, 480, 640);
        let ear = portrait.mean_eye_aspect_ratio(480, 640).unwrap();
        assert!((ear - 0.3).abs() < 1e-3, "got {ear}");
    }

    #[test]
    fn test_ear_closed_eye_below_threshold() {
        let mesh = mesh_with_eyes(10.0, 100.0);
        let ear = mesh.mean_eye_aspect_ratio(1000, 1000).unwrap();
        assert!(ear < BlinkConfig::default().ear_threshold);
    }

    #[test]
    fn test_ear_missing_landmarks() {
        let mesh = FaceMesh::new(vec![Point { x: 0.5, y: 0.5 }; 100]);
        assert!(mesh.eye_aspect_ratio(&RIGHT_EYE, 640, 480).is_none());
    }

    #[test]
    fn test_ear_degenerate_eye() {
        let mesh = FaceMesh::new(vec![Point { x: 0.5, y: 0.5 }; 468]);
        assert!(mesh.mean_eye_aspect_ratio(640, 480).is_none());
    }

    #[test]
    fn test_two_closed_frames_record_one_blink() {
        let mut state = BlinkState::new(BlinkConfig::default());
        let live = feed(&mut state, &[0.30, 0.15, 0.15, 0.30]);
        assert!(live);
        assert_eq!(state.blink_count(), 1);
        // Two opens recorded: a non-event and the blink
        assert_eq!(state.window().len(), 2);
    }

    #[test]
    fn test_single_closed_frame_is_not_a_blink() {
        let mut state = BlinkState::new(BlinkConfig::default());
        let live = feed(&mut state, &[0.30, 0.15, 0.30]);
        assert!(!live);
        assert_eq!(state.blink_count(), 0);
    }

    #[test]
    fn test_closure_without_reopen_is_not_recorded() {
        let mut state = BlinkState::new(BlinkConfig::default());
        assert!(!feed(&mut state, &[0.30, 0.10, 0.10, 0.10]));
        assert_eq!(state.closed_frames(), 3);
        assert_eq!(state.blink_count(), 0);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut state = BlinkState::new(BlinkConfig::default());
        // 0.21 is not below the threshold; counts as open
        assert!(!feed(&mut state, &[0.21, 0.21, 0.30]));
        assert_eq!(state.blink_count(), 0);
    }

    #[test]
    fn test_verdict_holds_until_blink_ages_out() {
        let config = BlinkConfig {
            window_size: 5,
            ..BlinkConfig::default()
        };
        let mut state = BlinkState::new(config);

        // Window: [0, 1]
        assert!(feed(&mut state, &[0.30, 0.15, 0.15, 0.30]));

        // Three more opens fill the window: [0, 1, 0, 0, 0]
        for _ in 0..3 {
            assert!(state.update(0.30));
        }
        // Evicts the leading 0: [1, 0, 0, 0, 0]
        assert!(state.update(0.30));
        // Evicts the blink
        assert!(!state.update(0.30));
        assert_eq!(state.window().len(), 5);
    }

    #[test]
    fn test_min_blinks() {
        let config = BlinkConfig {
            min_blinks: 2,
            ..BlinkConfig::default()
        };
        let mut state = BlinkState::new(config);
        assert!(!feed(&mut state, &[0.30, 0.1, 0.1, 0.30]));
        assert!(feed(&mut state, &[0.1, 0.1, 0.30]));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut state = BlinkState::new(BlinkConfig::default());
        feed(&mut state, &[0.30, 0.15, 0.15, 0.30, 0.15]);
        assert!(state.is_live());
        state.reset();
        assert!(!state.is_live());
        assert_eq!(state.closed_frames(), 0);
        assert!(state.window().is_empty());
    }

    #[test]
    fn test_update_mesh() {
        let open = mesh_with_eyes(30.0, 100.0);
        let closed = mesh_with_eyes(8.0, 100.0);
        let mut state = BlinkState::new(BlinkConfig::default());
        for mesh in [&open, &closed, &closed, &open] {
            state.update_mesh(mesh, 1000, 1000).unwrap();
        }
        assert!(state.is_live());
        assert!(state
            .update_mesh(&FaceMesh::default(), 1000, 1000)
            .is_none());
    }

    #[test]
    fn test_zero_min_blinks_is_raised() {
        let mut state = BlinkState::new(BlinkConfig {
            min_blinks: 0,
            ..BlinkConfig::default()
        });
        assert_eq!(state.config().min_blinks, 1);
        assert!(!state.update(0.30));
        assert!(!state.is_live());
        assert!(feed(&mut state, &[0.15, 0.15, 0.30]));
    }

    #[test]
    fn test_zero_consec_frames_is_raised() {
        let mut state = BlinkState::new(BlinkConfig {
            consec_frames: 0,
            ..BlinkConfig::default()
        });
        assert_eq!(state.config().consec_frames, 1);
        assert!(!feed(&mut state, &[0.30, 0.31, 0.30]));
        assert_eq!(state.blink_count(), 0);
        assert!(feed(&mut state, &[0.15, 0.30]));
    }

    #[test]
    fn test_window_zero_capacity_is_raised() {
        let mut window = BlinkWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push(true);
        window.push(false);
        assert_eq!(window.len(), 1);
        assert_eq!(window.blinks(), 0);
    }
}
