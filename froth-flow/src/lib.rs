//! # Froth Surface Velocity Tracking Library
//!
//! This library provides the frame-acquisition and motion-tracking core for
//! monitoring froth-flotation video. Frames are delivered from a background
//! capture thread with drop-on-busy backpressure, cropped per user-defined
//! region, run through an optical flow estimator and converted into calibrated
//! per-second surface velocities along a configured overflow direction.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use froth_flow::prelude::v1::*;
//! ```
//!
//! You may need [`nalgebra`](https://crates.io/crates/nalgebra) to make use of
//! the functionality. Concrete capture and flow backends (OpenCV) live in the
//! `froth-cv` crate.

pub mod calibration;
pub mod flow;
pub mod frame;
pub mod pipeline;
pub mod source;
pub mod tracker;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            calibration::Calibration,
            flow::{
                FarnebackParams, FlowEstimator, FlowParams, LucasKanadeParams, TermCriterion,
            },
            frame::{Bgr, Frame, RoiRect},
            pipeline::{EstimatorFactory, Pipeline, ProcessOutcome},
            source::{frame_gate, Capture, FrameFeed, GateReceiver, GateSender, SourceKind},
            tracker::{HistoryEntry, RoiTracker, TrackUpdate},
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
