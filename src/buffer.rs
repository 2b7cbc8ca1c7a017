//! Sliding gesture window with reset-on-hand-loss.

use std::collections::VecDeque;

use crate::config::WindowConfig;
use crate::features::{Extracted, FeatureExtractor, FeatureVector};
use crate::frame::RawFrame;

/// Bounded window of feature vectors plus the frames they came from.
///
/// Single owner; callers that share it across threads must wrap it themselves.
#[derive(Debug, Clone)]
pub struct GestureBuffer {
    features: VecDeque<FeatureVector>,
    frames: VecDeque<RawFrame>,
    extractor: FeatureExtractor,
    capacity: usize,
    short_lag: usize,
    long_lag: usize,
    stride: usize,
}

impl GestureBuffer {
    pub fn new(cfg: &WindowConfig) -> Self {
        Self {
            features: VecDeque::with_capacity(cfg.capacity + 1),
            frames: VecDeque::with_capacity(cfg.capacity + 1),
            extractor: FeatureExtractor::new(),
            capacity: cfg.capacity,
            short_lag: cfg.short_lag.max(1),
            long_lag: cfg.long_lag.max(1),
            stride: cfg.stride,
        }
    }

    /// Extracts features for `frame` and slides the window.
    ///
    /// Returns `false` when the frame had no hand and the window was reset.
    pub fn append(&mut self, frame: &RawFrame) -> bool {
        self.frames.push_back(frame.clone());
        let (short_ref, long_ref) = self.reference_frames();
        let extracted = self.extractor.extract(frame, short_ref, long_ref);

        match extracted {
            Extracted::HandAbsent => {
                self.clear();
                false
            }
            Extracted::Features(f) => {
                self.features.push_back(f);
                while self.features.len() > self.capacity {
                    self.features.pop_front();
                    self.frames.pop_front();
                }
                true
            }
        }
    }

    // The current frame is already the last entry of `frames`; the reference
    // for lag L is the L-th most recent frame, once more than L features exist.
    fn reference_frames(&self) -> (&RawFrame, &RawFrame) {
        let n = self.features.len();
        let len = self.frames.len();
        let current = &self.frames[len - 1];
        let lookup = |lag: usize| {
            if n > lag {
                &self.frames[len - lag]
            } else {
                current
            }
        };
        (lookup(self.short_lag), lookup(self.long_lag))
    }

    pub fn is_full(&self) -> bool {
        self.features.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.features.clear();
        self.frames.clear();
    }

    /// Full, pre-downsample feature sequence, oldest first.
    pub fn features(&self) -> Vec<FeatureVector> {
        self.features.iter().copied().collect()
    }

    pub fn frames(&self) -> impl Iterator<Item = &RawFrame> {
        self.frames.iter()
    }

    /// Model input for the current window; the live buffer is untouched.
    pub fn downsample(&self) -> Vec<FeatureVector> {
        downsample_iter(self.features.iter(), self.features.len(), self.stride)
    }
}

/// Keeps indices `0, stride, 2*stride, ...` and then always appends the last
/// vector, even when its index was already kept.
pub fn downsample(seq: &[FeatureVector], stride: usize) -> Vec<FeatureVector> {
    downsample_iter(seq.iter(), seq.len(), stride)
}

fn downsample_iter<'a>(
    seq: impl Iterator<Item = &'a FeatureVector>,
    len: usize,
    stride: usize,
) -> Vec<FeatureVector> {
    let stride = stride.max(1);
    let mut out = Vec::with_capacity(len / stride + 2);
    let mut last = None;
    for (i, v) in seq.enumerate() {
        if i % stride == 0 {
            out.push(*v);
        }
        last = Some(*v);
    }
    if let Some(v) = last {
        out.push(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{absent_frame, frame_at};

    fn buffer() -> GestureBuffer {
        GestureBuffer::new(&WindowConfig::default())
    }

    #[test]
    fn test_zero_lags_are_treated_as_one() {
        let cfg = WindowConfig {
            short_lag: 0,
            long_lag: 0,
            ..WindowConfig::default()
        };
        let mut b = GestureBuffer::new(&cfg);
        for i in 0..5 {
            assert!(b.append(&frame_at(i as f64 * 2.0, 0.0, 0.0)));
        }
        assert_eq!(b.len(), 5);
        let last = b.features()[4];
        let mut one = GestureBuffer::new(&WindowConfig {
            short_lag: 1,
            long_lag: 1,
            ..WindowConfig::default()
        });
        for i in 0..5 {
            one.append(&frame_at(i as f64 * 2.0, 0.0, 0.0));
        }
        assert_eq!(last, one.features()[4]);
    }

    #[test]
    fn test_absent_frames_never_grow_buffer() {
        let mut b = buffer();
        for _ in 0..100 {
            assert!(!b.append(&absent_frame()));
            assert_eq!(b.len(), 0);
        }
        assert_eq!(b.frames().count(), 0);
    }

    #[test]
    fn test_length_tracks_frames_up_to_capacity() {
        let mut b = buffer();
        for i in 0..40 {
            b.append(&frame_at(i as f64, 0.0, 0.0));
            assert_eq!(b.len(), i + 1);
        }
        assert!(b.is_full());
    }

    #[test]
    fn test_fifo_eviction_keeps_newest() {
        let mut b = buffer();
        for i in 0..55 {
            b.append(&frame_at(i as f64, 0.0, 0.0));
        }
        assert_eq!(b.len(), 40);
        let xs: Vec<f64> = b.features().iter().map(|f| f[0]).collect();
        let expected: Vec<f64> = (15..55).map(|i| i as f64).collect();
        assert_eq!(xs, expected);
        let frame_xs: Vec<f64> = b
            .frames()
            .map(|f| f.dominant_hand().unwrap().palm_position[0])
            .collect();
        assert_eq!(frame_xs, expected);
    }

    #[test]
    fn test_hand_loss_resets_everything() {
        let mut b = buffer();
        for i in 0..20 {
            b.append(&frame_at(i as f64, 0.0, 0.0));
        }
        b.append(&absent_frame());
        assert!(b.is_empty());
        assert_eq!(b.frames().count(), 0);
        b.append(&frame_at(1.0, 0.0, 0.0));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_lag_references() {
        let mut b = buffer();
        for i in 0..12 {
            b.append(&frame_at(i as f64, 0.0, 0.0));
        }
        let f = b.features();
        // Early frames fall back to themselves.
        assert_eq!(f[5][6], 0.0);
        // Frame 6: six features buffered before it, short ref is frame 2.
        assert_eq!(f[6][6], 4.0);
        assert_eq!(f[6][12], 0.0);
        // Frame 11: long ref is frame 2.
        assert_eq!(f[11][6], 4.0);
        assert_eq!(f[11][12], 9.0);
    }

    #[test]
    fn test_downsample_indices() {
        let mut b = buffer();
        for i in 0..40 {
            b.append(&frame_at(i as f64, 0.0, 0.0));
        }
        let ds = b.downsample();
        assert_eq!(ds.len(), 9);
        let idx: Vec<f64> = ds.iter().map(|f| f[0]).collect();
        assert_eq!(idx, vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 39.0]);
        assert_eq!(b.len(), 40);
    }

    #[test]
    fn test_downsample_duplicates_last_kept_index() {
        let seq: Vec<FeatureVector> = (0..36)
            .map(|i| {
                let mut v = [0.0; 24];
                v[0] = i as f64;
                v
            })
            .collect();
        let ds = downsample(&seq, 5);
        assert_eq!(ds.len(), 9);
        assert_eq!(ds[7][0], 35.0);
        assert_eq!(ds[8][0], 35.0);
        assert!(downsample(&[], 5).is_empty());
    }
}
