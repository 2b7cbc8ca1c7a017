//! Per-frame feature engineering.
//!
//! Layout of a feature vector (persisted models depend on it):
//! `[0..6)` position, `[6..12)` short-lag delta, `[12..18)` long-lag delta,
//! `[18..24)` pseudo-acceleration. Each block is `x, y, z, yaw, pitch, roll`.

use crate::frame::RawFrame;

pub const POSE_LEN: usize = 6;
pub const FEATURE_LEN: usize = 4 * POSE_LEN;

/// Positional stand-in for a reference frame that has no hand.
///
/// Only ever enters derivative arithmetic; it is never emitted as a position.
pub const MISSING_POSITION_SENTINEL: f64 = 5000.0;

pub type Pose = [f64; POSE_LEN];
pub type FeatureVector = [f64; FEATURE_LEN];

/// Result of extracting one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extracted {
    Features(FeatureVector),
    /// The current frame has no hand; the caller must reset its window.
    HandAbsent,
}

impl Extracted {
    pub fn features(self) -> Option<FeatureVector> {
        match self {
            Extracted::Features(f) => Some(f),
            Extracted::HandAbsent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Pure function of the three frames.
    pub fn extract(
        &self,
        current: &RawFrame,
        short_ref: &RawFrame,
        long_ref: &RawFrame,
    ) -> Extracted {
        let Some(p0) = pose(current) else {
            return Extracted::HandAbsent;
        };
        let p1 = pose(short_ref).unwrap_or([MISSING_POSITION_SENTINEL; POSE_LEN]);
        let p2 = pose(long_ref).unwrap_or([MISSING_POSITION_SENTINEL; POSE_LEN]);

        let mut out = [0.0; FEATURE_LEN];
        for i in 0..POSE_LEN {
            out[i] = p0[i];
            out[POSE_LEN + i] = p0[i] - p1[i];
            out[2 * POSE_LEN + i] = p0[i] - p2[i];
            out[3 * POSE_LEN + i] = (p0[i] - p1[i]) - (p1[i] - p2[i]);
        }
        Extracted::Features(out)
    }
}

/// Positional sub-vector of the dominant hand, if there is one.
pub fn pose(frame: &RawFrame) -> Option<Pose> {
    let h = frame.dominant_hand()?;
    Some([
        h.palm_position[0],
        h.palm_position[1],
        h.palm_position[2],
        h.yaw(),
        h.pitch(),
        h.roll(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HandSample;

    fn frame(x: f64, y: f64, z: f64) -> RawFrame {
        RawFrame {
            id: 0,
            timestamp_us: 0,
            hands: vec![HandSample {
                palm_position: [x, y, z],
                palm_normal: [0.0, -1.0, 0.0],
                direction: [0.0, 0.0, -1.0],
                finger_count: 5,
            }],
        }
    }

    #[test]
    fn test_absent_current_hand() {
        let ex = FeatureExtractor::new();
        let empty = RawFrame::default();
        let present = frame(1.0, 2.0, 3.0);
        assert_eq!(ex.extract(&empty, &present, &present), Extracted::HandAbsent);
    }

    #[test]
    fn test_block_layout() {
        let ex = FeatureExtractor::new();
        let f = ex
            .extract(&frame(10.0, 0.0, 0.0), &frame(7.0, 0.0, 0.0), &frame(1.0, 0.0, 0.0))
            .features()
            .unwrap();
        assert_eq!(f.len(), 24);
        assert_eq!(f[0], 10.0);
        assert_eq!(f[6], 3.0); // short delta
        assert_eq!(f[12], 9.0); // long delta
        assert_eq!(f[18], 3.0 - 6.0); // (p0-p1)-(p1-p2)
        assert!(f[3..6].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_same_frame_references_give_zero_derivatives() {
        let ex = FeatureExtractor::new();
        let cur = frame(4.0, 5.0, 6.0);
        let f = ex.extract(&cur, &cur, &cur).features().unwrap();
        assert!(f[POSE_LEN..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_absent_reference_uses_sentinel() {
        let ex = FeatureExtractor::new();
        let cur = frame(0.0, 0.0, 0.0);
        let f = ex.extract(&cur, &RawFrame::default(), &cur).features().unwrap();
        assert_eq!(f[6], -MISSING_POSITION_SENTINEL);
        assert_eq!(f[0], 0.0);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let ex = FeatureExtractor::new();
        let (a, b, c) = (frame(1.5, -2.25, 3.0), frame(0.1, 0.2, 0.3), frame(-9.0, 8.0, 7.0));
        let first = ex.extract(&a, &b, &c).features().unwrap();
        for _ in 0..10 {
            let again = ex.extract(&a, &b, &c).features().unwrap();
            assert!(first.iter().zip(&again).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }
}
