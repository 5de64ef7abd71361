//! driftreg - feature-tracked drift registration for image sequences
//!
//! A run tracks user-chosen feature points from frame to frame, estimates the
//! transform that maps them back onto their reference positions and rewrites
//! every frame in the range resampled into reference coordinates.

pub mod config;
pub mod error;
pub mod estimate;
pub mod linalg;
pub mod raster;
pub mod registration;
pub mod sequence;
pub mod tracker;
pub mod transform;
pub mod warp;

pub use error::{RegistrationError, Result};
pub use raster::{PixelData, Raster, SampleType};
pub use registration::{
    CancelToken, Direction, Point, RegistrationParams, RunReport, RunState, Sequencer,
};
pub use sequence::{ChannelSet, DirectorySequence, FrameSequence, SequenceConfig};
pub use transform::Transform;
