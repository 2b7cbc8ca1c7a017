//! Control loops over a frame source: live recognition and example recording.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use crate::bank::SequenceScorer;
use crate::buffer::GestureBuffer;
use crate::classifier::{Decision, GestureClassifier, MetaClassifier};
use crate::config::Config;
use crate::dataset::save_example;
use crate::frame::FrameSource;
use crate::transport::{MessageSink, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Classification slower than this is reported; frames are never queued.
    pub latency_budget: Duration,
    pub send_hand_state: bool,
}

impl SessionOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            latency_budget: Duration::from_millis(cfg.runtime.latency_budget_ms),
            send_hand_state: cfg.transport.send_hand_state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub hand_frames: u64,
    pub resets: u64,
    pub classifications: u64,
    pub gestures: u64,
    pub low_confidence: u64,
    pub classify_errors: u64,
    pub over_budget: u64,
    pub send_failures: u64,
}

/// Runs until the source ends or `stop` is raised. `Gesture Start` and
/// `Gesture Stop` bracket the session even when the source fails.
pub fn run_session<S, Q, M>(
    source: &mut S,
    buffer: &mut GestureBuffer,
    scorer: &Q,
    classifier: &GestureClassifier<M>,
    sink: &mut dyn MessageSink,
    stop: &AtomicBool,
    opts: &SessionOptions,
) -> Result<SessionStats>
where
    S: FrameSource + ?Sized,
    Q: SequenceScorer,
    M: MetaClassifier,
{
    let mut stats = SessionStats::default();
    emit(sink, &OutboundMessage::gesture("Start"), &mut stats);
    info!("recognition session started");

    let result = drive(source, buffer, scorer, classifier, sink, stop, opts, &mut stats);

    emit(sink, &OutboundMessage::gesture("Stop"), &mut stats);
    info!(
        "recognition session ended: {} frames, {} gestures",
        stats.frames, stats.gestures
    );
    result.map(|_| stats)
}

#[allow(clippy::too_many_arguments)]
fn drive<S, Q, M>(
    source: &mut S,
    buffer: &mut GestureBuffer,
    scorer: &Q,
    classifier: &GestureClassifier<M>,
    sink: &mut dyn MessageSink,
    stop: &AtomicBool,
    opts: &SessionOptions,
    stats: &mut SessionStats,
) -> Result<()>
where
    S: FrameSource + ?Sized,
    Q: SequenceScorer,
    M: MetaClassifier,
{
    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = source.next_frame().context("frame source failed")? else {
            break;
        };
        stats.frames += 1;

        let had_window = !buffer.is_empty();
        if !buffer.append(&frame) {
            if had_window {
                stats.resets += 1;
                debug!("hand lost; window reset");
            }
            continue;
        }
        stats.hand_frames += 1;

        if buffer.is_full() {
            classify_window(buffer, scorer, classifier, sink, opts, stats);
        }

        if opts.send_hand_state {
            if let Some(hand) = frame.dominant_hand() {
                for msg in OutboundMessage::hand_state(hand) {
                    emit(sink, &msg, stats);
                }
            }
        }
    }
    Ok(())
}

fn classify_window<Q, M>(
    buffer: &mut GestureBuffer,
    scorer: &Q,
    classifier: &GestureClassifier<M>,
    sink: &mut dyn MessageSink,
    opts: &SessionOptions,
    stats: &mut SessionStats,
) where
    Q: SequenceScorer,
    M: MetaClassifier,
{
    let started = Instant::now();
    let decision = classifier.classify(scorer, buffer);
    let elapsed = started.elapsed();
    stats.classifications += 1;
    if elapsed > opts.latency_budget {
        stats.over_budget += 1;
        warn!(
            "classification took {} ms (budget {} ms)",
            elapsed.as_millis(),
            opts.latency_budget.as_millis()
        );
    }

    match decision {
        Ok(Decision::Committed(m)) => {
            info!("gesture '{}' (posterior {:.3})", m.label, m.posterior);
            stats.gestures += 1;
            emit(sink, &OutboundMessage::Gesture(m.label), stats);
            buffer.clear();
        }
        Ok(Decision::NoConfidentMatch { best }) => {
            debug!("no confident match (best '{}' at {:.3})", best.label, best.posterior);
            stats.low_confidence += 1;
        }
        Err(e) => {
            warn!("classification failed: {e}");
            stats.classify_errors += 1;
            buffer.clear();
        }
    }
}

/// Saves every full window as the next numbered example of `class` until
/// `count` examples exist or the source ends.
pub fn record_session<S>(
    source: &mut S,
    buffer: &mut GestureBuffer,
    data_dir: &Path,
    class: &str,
    count: usize,
    stop: &AtomicBool,
) -> Result<Vec<PathBuf>>
where
    S: FrameSource + ?Sized,
{
    let mut saved = Vec::with_capacity(count);
    while saved.len() < count && !stop.load(Ordering::Relaxed) {
        let Some(frame) = source.next_frame().context("frame source failed")? else {
            break;
        };
        if !buffer.append(&frame) || !buffer.is_full() {
            continue;
        }
        let path = save_example(data_dir, class, &buffer.features())?;
        info!("recorded example {}/{count} of '{class}'", saved.len() + 1);
        saved.push(path);
        buffer.clear();
    }
    if saved.len() < count {
        warn!("recorded {} of {count} requested examples", saved.len());
    }
    Ok(saved)
}

fn emit(sink: &mut dyn MessageSink, msg: &OutboundMessage, stats: &mut SessionStats) {
    if let Err(e) = sink.send(msg) {
        stats.send_failures += 1;
        warn!("send failed: {e:#}");
    }
}
