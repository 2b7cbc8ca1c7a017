//! Deterministic synthetic hand tracks and in-memory collaborators for tests.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::VecDeque;
use std::f64::consts::PI;

use crate::bank::TrainingExample;
use crate::buffer::GestureBuffer;
use crate::config::WindowConfig;
use crate::features::FeatureVector;
use crate::frame::{FrameSource, HandSample, RawFrame};
use crate::transport::{MessageSink, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    Swipe,
    Tap,
    Circle,
}

impl GestureKind {
    pub const ALL: [GestureKind; 3] = [GestureKind::Swipe, GestureKind::Tap, GestureKind::Circle];

    pub fn label(self) -> &'static str {
        match self {
            GestureKind::Swipe => "Swipe",
            GestureKind::Tap => "Tap",
            GestureKind::Circle => "Circle",
        }
    }
}

pub fn frame_at(x: f64, y: f64, z: f64) -> RawFrame {
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

pub fn absent_frame() -> RawFrame {
    RawFrame::default()
}

/// `len` frames of one gesture with per-example offset and per-frame jitter.
pub fn gesture_frames(kind: GestureKind, rng: &mut StdRng, len: usize) -> Vec<RawFrame> {
    let off = [
        rng.gen_range(-10.0..10.0),
        rng.gen_range(-10.0..10.0),
        rng.gen_range(-10.0..10.0),
    ];
    (0..len)
        .map(|t| {
            let u = t as f64 / (len - 1).max(1) as f64;
            let (x, y, z) = match kind {
                GestureKind::Swipe => (-120.0 + 240.0 * u, 200.0, 0.0),
                GestureKind::Tap => (0.0, 200.0 - 60.0 * (PI * u).sin(), -30.0 * (PI * u).sin()),
                GestureKind::Circle => {
                    let a = 2.0 * PI * u;
                    (80.0 * a.cos(), 200.0 + 80.0 * a.sin(), 0.0)
                }
            };
            let mut f = frame_at(
                x + off[0] + rng.gen_range(-1.5..1.5),
                y + off[1] + rng.gen_range(-1.5..1.5),
                z + off[2] + rng.gen_range(-1.5..1.5),
            );
            f.id = t as u64;
            f.timestamp_us = t as u64 * 10_000;
            let hand = &mut f.hands[0];
            hand.direction = [rng.gen_range(-0.02..0.02), rng.gen_range(-0.02..0.02), -1.0];
            hand.palm_normal = [rng.gen_range(-0.02..0.02), -1.0, rng.gen_range(-0.02..0.02)];
            f
        })
        .collect()
}

/// Feeds a fresh 40-frame gesture through a buffer and returns it full.
pub fn recorded_buffer(kind: GestureKind, rng: &mut StdRng) -> GestureBuffer {
    let cfg = WindowConfig::default();
    let mut buffer = GestureBuffer::new(&cfg);
    for f in gesture_frames(kind, rng, cfg.capacity) {
        buffer.append(&f);
    }
    buffer
}

pub fn recorded_window(kind: GestureKind, rng: &mut StdRng) -> Vec<FeatureVector> {
    recorded_buffer(kind, rng).features()
}

/// One downsampled example built from a `len`-frame gesture.
pub fn example_of_len(kind: GestureKind, rng: &mut StdRng, len: usize) -> TrainingExample {
    let cfg = WindowConfig::default();
    let mut buffer = GestureBuffer::new(&cfg);
    for f in gesture_frames(kind, rng, len) {
        buffer.append(&f);
    }
    TrainingExample {
        label: kind.label().to_string(),
        sequence: buffer.downsample(),
    }
}

/// `per_class` downsampled examples of each of Swipe, Tap and Circle.
pub fn synthetic_examples(seed: u64, per_class: usize) -> Vec<TrainingExample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::new();
    for kind in GestureKind::ALL {
        for _ in 0..per_class {
            out.push(TrainingExample {
                label: kind.label().to_string(),
                sequence: recorded_buffer(kind, &mut rng).downsample(),
            });
        }
    }
    out
}

/// Frames served from memory.
pub struct VecSource(pub VecDeque<RawFrame>);

impl VecSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self(frames.into())
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        Ok(self.0.pop_front())
    }
}

/// Keeps every rendered line; fails every send when `fail` is set.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub lines: Vec<String>,
    pub fail: bool,
}

impl MessageSink for RecordingSink {
    fn send(&mut self, msg: &OutboundMessage) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        self.lines.push(msg.to_string());
        Ok(())
    }
}
