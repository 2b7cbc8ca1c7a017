//! Hand gesture recognition from skeletal tracking frames.
//!
//! Frames become 24-float feature vectors in a sliding window; windows are
//! scored by one Gaussian HMM per gesture class and a softmax meta-classifier
//! turns the score vector into a thresholded decision.

pub mod bank;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod features;
pub mod frame;
pub mod harness;
pub mod hmm;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;
