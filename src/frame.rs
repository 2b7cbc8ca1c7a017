//! Skeletal-tracking frames and the sources that deliver them.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    io::BufRead,
    sync::{Arc, Condvar, Mutex},
    thread,
};

/// One tracked hand as reported by the acquisition device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandSample {
    /// Palm centre in device coordinates (mm).
    pub palm_position: [f64; 3],
    /// Unit vector pointing out of the palm.
    pub palm_normal: [f64; 3],
    /// Unit vector from the palm towards the fingers.
    pub direction: [f64; 3],
    #[serde(default)]
    pub finger_count: usize,
}

impl HandSample {
    /// Rotation around the vertical axis, radians.
    pub fn yaw(&self) -> f64 {
        self.direction[0].atan2(-self.direction[2])
    }

    /// Rotation around the horizontal axis, radians.
    pub fn pitch(&self) -> f64 {
        self.direction[1].atan2(-self.direction[2])
    }

    /// Rotation around the depth axis, taken from the palm normal, radians.
    pub fn roll(&self) -> f64 {
        self.palm_normal[0].atan2(-self.palm_normal[1])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub timestamp_us: u64,
    #[serde(default)]
    pub hands: Vec<HandSample>,
}

impl RawFrame {
    /// The single hand we track: the first one the device reports.
    pub fn dominant_hand(&self) -> Option<&HandSample> {
        self.hands.first()
    }
}

/// Anything that yields frames to the control loop. `Ok(None)` ends the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// Replays frames stored one JSON object per line.
pub struct JsonLinesSource<R: BufRead> {
    reader: R,
    line_no: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }
}

impl<R: BufRead> FrameSource for JsonLinesSource<R> {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let frame: RawFrame = serde_json::from_str(&line)
                .with_context(|| format!("invalid frame on line {}", self.line_no))?;
            return Ok(Some(frame));
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<RawFrame>,
    dropped: u64,
    closed: bool,
}

/// Single-frame handoff between a producer thread and the control loop.
///
/// The producer always overwrites the slot; a frame replaced before the
/// consumer took it is counted as dropped. Nothing is ever queued.
#[derive(Debug, Clone, Default)]
pub struct LatestFrameSlot {
    inner: Arc<(Mutex<SlotState>, Condvar)>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: RawFrame) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut st) = lock.lock() {
            if st.latest.replace(frame).is_some() {
                st.dropped += 1;
            }
            cvar.notify_one();
        }
    }

    /// Marks the end of the stream; the consumer drains the last frame first.
    pub fn close(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut st) = lock.lock() {
            st.closed = true;
            cvar.notify_all();
        }
    }

    pub fn dropped(&self) -> u64 {
        self.inner.0.lock().map(|st| st.dropped).unwrap_or(0)
    }

    /// Spawns a reader thread publishing every parsed line into the slot.
    pub fn spawn_reader<R>(reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let slot = Self::new();
        let producer = slot.clone();
        thread::spawn(move || {
            let mut src = JsonLinesSource::new(reader);
            loop {
                match src.next_frame() {
                    Ok(Some(frame)) => producer.publish(frame),
                    Ok(None) => break,
                    Err(e) => warn!("frame reader: {e:#}"),
                }
            }
            producer.close();
        });
        slot
    }
}

impl FrameSource for LatestFrameSlot {
    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let (lock, cvar) = &*self.inner;
        let mut st = lock
            .lock()
            .map_err(|_| anyhow::anyhow!("frame slot poisoned"))?;
        loop {
            if let Some(frame) = st.latest.take() {
                return Ok(Some(frame));
            }
            if st.closed {
                return Ok(None);
            }
            st = cvar
                .wait(st)
                .map_err(|_| anyhow::anyhow!("frame slot poisoned"))?;
        }
    }
}
