//! Registration run sequencing
//!
//! A run walks the frame range away from a reference frame, tracking the
//! point set from each frame to the next, estimating the transform that
//! brings the tracked points back onto the reference points, and writing
//! each frame resampled into reference coordinates over the original file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{RegistrationError, Result};
use crate::estimate::estimate;
use crate::raster::Raster;
use crate::sequence::{ChannelSet, FrameSequence};
use crate::tracker::{PointTracker, TrackerConfig};
use crate::transform::TransformKind;
use crate::warp::{WarpConfig, Warper};

/// Walking direction through the frame range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Increasing frame index, each frame tracked from `t - 1`
    #[default]
    Forward,
    /// Decreasing frame index, each frame tracked from `t + 1`
    Backward,
    /// Backward from the reference to `start`, then forward to `end`
    Both,
}

/// A 2D point as it appears in config files
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<Point> for Point2<f64> {
    fn from(p: Point) -> Self {
        Point2::new(p.x, p.y)
    }
}

impl From<Point2<f64>> for Point {
    fn from(p: Point2<f64>) -> Self {
        Point::new(p.x, p.y)
    }
}

/// Parameters of one run, loaded from the `[registration]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationParams {
    #[serde(default)]
    pub reference_frame: usize,
    #[serde(default)]
    pub start_frame: usize,
    /// Last frame of the range; the final frame of the sequence when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_frame: Option<usize>,
    #[serde(default)]
    pub direction: Direction,
    /// Feature positions in the reference frame, in pixels
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            reference_frame: 0,
            start_frame: 0,
            end_frame: None,
            direction: Direction::Forward,
            points: Vec::new(),
        }
    }
}

/// Lifecycle of a sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Cooperative cancellation flag, checked between frame steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What happened to one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Warped into reference coordinates
    Registered,
    /// No transform could be estimated; the original frame was written
    Unwarped,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub frame: usize,
    pub previous: usize,
    pub outcome: FrameOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformKind>,
    pub tracked_points: usize,
    pub points: Vec<Point>,
}

/// Summary of a run, serializable for `--report`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub backend: String,
    pub registered: usize,
    pub unwarped: usize,
    pub skipped: usize,
    pub frames: Vec<FrameRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

impl RunReport {
    fn new(backend: &str) -> Self {
        Self {
            state: RunState::Idle,
            backend: backend.to_string(),
            registered: 0,
            unwarped: 0,
            skipped: 0,
            frames: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }
}

/// Per-run point state: fixed reference positions and their tracked
/// counterparts, index-aligned for the whole run.
#[derive(Debug, Clone)]
pub struct PointSet {
    reference: Vec<Point2<f64>>,
    current: Vec<Point2<f64>>,
}

impl PointSet {
    pub fn new(reference: Vec<Point2<f64>>) -> Self {
        Self {
            current: reference.clone(),
            reference,
        }
    }

    pub fn reference(&self) -> &[Point2<f64>] {
        &self.reference
    }

    pub fn current(&self) -> &[Point2<f64>] {
        &self.current
    }

    /// Mutable view handed to the tracker; the slice cannot be resized
    pub fn current_mut(&mut self) -> &mut [Point2<f64>] {
        &mut self.current
    }

    pub fn reset(&mut self) {
        self.current.copy_from_slice(&self.reference);
    }

    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

/// Drives a registration run over a [`FrameSequence`]
pub struct Sequencer {
    tracker: PointTracker,
    warper: Warper,
    state: RunState,
    cancel: CancelToken,
}

impl Sequencer {
    /// Build the tracker and select the warp backend; accelerator resources
    /// live as long as the sequencer.
    pub fn new(tracker: &TrackerConfig, warp: &WarpConfig) -> Self {
        Self::with_parts(PointTracker::new(tracker), Warper::new(warp))
    }

    pub fn with_parts(tracker: PointTracker, warper: Warper) -> Self {
        Self {
            tracker,
            warper,
            state: RunState::Idle,
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Handle that cancels the current or next run from another thread.
    /// The flag is cleared when that run ends, so later runs start fresh.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run registration; `true` on success. Details are in [`Self::run_with_report`].
    pub fn run(&mut self, sequence: &mut dyn FrameSequence, params: &RegistrationParams) -> bool {
        self.run_with_report(sequence, params).state == RunState::Completed
    }

    pub fn run_with_report(
        &mut self,
        sequence: &mut dyn FrameSequence,
        params: &RegistrationParams,
    ) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(self.warper.backend_name());

        match self.execute(sequence, params, &mut report) {
            Ok(()) => {
                self.state = RunState::Completed;
                info!(
                    "Registration completed: {} registered, {} unwarped, {} skipped",
                    report.registered, report.unwarped, report.skipped
                );
            }
            Err(e) => {
                self.state = RunState::Failed;
                error!("Registration failed: {}", e);
                report.error = Some(e.to_string());
            }
        }

        self.cancel.reset();
        report.state = self.state;
        report.elapsed_ms = started.elapsed().as_millis();
        report
    }

    fn execute(
        &mut self,
        sequence: &mut dyn FrameSequence,
        params: &RegistrationParams,
        report: &mut RunReport,
    ) -> Result<()> {
        let len = sequence.len();
        let (start, end) = validate(params, len)?;
        let reference = params.reference_frame;

        sequence.backup_originals()?;

        self.state = RunState::Running;
        info!(
            "Registering frames {}..={} against reference {} ({:?}, {} points, {} backend)",
            start,
            end,
            reference,
            params.direction,
            params.points.len(),
            self.warper.backend_name()
        );

        let mut points = PointSet::new(params.points.iter().map(|&p| p.into()).collect());

        match params.direction {
            Direction::Forward => {
                self.walk(sequence, &mut points, start..=end, 1, reference, report)?;
            }
            Direction::Backward => {
                self.walk(sequence, &mut points, (start..=end).rev(), -1, reference, report)?;
            }
            Direction::Both => {
                self.walk(sequence, &mut points, (start..=reference).rev(), -1, reference, report)?;
                points.reset();
                self.walk(sequence, &mut points, reference + 1..=end, 1, reference, report)?;
            }
        }

        Ok(())
    }

    /// One pass over `frames`, each tracked from `t - step`
    fn walk(
        &self,
        sequence: &mut dyn FrameSequence,
        points: &mut PointSet,
        frames: impl Iterator<Item = usize>,
        step: isize,
        reference: usize,
        report: &mut RunReport,
    ) -> Result<()> {
        let len = sequence.len();
        // Original pixels of the last processed frame; the file itself has
        // been overwritten with its registered version by then.
        let mut previous: Option<(usize, Raster)> = None;

        for t in frames {
            if t == reference {
                debug!("Frame {} is the reference frame", t);
                report.skipped += 1;
                continue;
            }

            let prev_index = t as isize - step;
            if prev_index < 0 || prev_index >= len as isize {
                debug!("Frame {} has no predecessor to track from", t);
                report.skipped += 1;
                continue;
            }
            let prev_index = prev_index as usize;

            if self.cancel.is_cancelled() {
                return Err(RegistrationError::Cancelled(t));
            }

            let prev_frame = match previous.take() {
                Some((index, frame)) if index == prev_index => frame,
                _ => sequence.image(prev_index, &ChannelSet::All)?,
            };
            let curr_frame = sequence.image(t, &ChannelSet::All)?;

            let tracked = self.tracker.track(&prev_frame, &curr_frame, points.current_mut());

            // current -> reference, inverted into the reference -> current sampling map
            let transform = estimate(points.current(), points.reference());
            let sampling = transform.and_then(|m| m.inverse());

            let warped = match &sampling {
                Some(s) => Some(self.warper.warp(&curr_frame, s)?),
                None => None,
            };
            let outcome = if warped.is_some() {
                report.registered += 1;
                FrameOutcome::Registered
            } else {
                report.unwarped += 1;
                FrameOutcome::Unwarped
            };

            let path = sequence.file_name_for_frame(t)?;
            sequence.save_image(warped.as_ref().unwrap_or(&curr_frame), &path, true)?;

            debug!(
                "Frame {} (from {}): {:?}, {}/{} points tracked",
                t,
                prev_index,
                outcome,
                tracked,
                points.len()
            );

            report.frames.push(FrameRecord {
                frame: t,
                previous: prev_index,
                outcome,
                transform: sampling.map(|s| s.kind()),
                tracked_points: tracked,
                points: points.current().iter().map(|&p| p.into()).collect(),
            });

            previous = Some((t, curr_frame));
        }

        Ok(())
    }
}

/// Check the range against the sequence and resolve the end frame
fn validate(params: &RegistrationParams, len: usize) -> Result<(usize, usize)> {
    if len == 0 {
        return Err(RegistrationError::InvalidRange("sequence is empty".to_string()));
    }
    let end = params.end_frame.unwrap_or(len - 1);
    if params.start_frame > end {
        return Err(RegistrationError::InvalidRange(format!(
            "start frame {} is after end frame {}",
            params.start_frame, end
        )));
    }
    if end >= len {
        return Err(RegistrationError::FrameOutOfRange { frame: end, len });
    }
    if params.reference_frame >= len {
        return Err(RegistrationError::FrameOutOfRange {
            frame: params.reference_frame,
            len,
        });
    }
    if params.direction == Direction::Both
        && !(params.start_frame..=end).contains(&params.reference_frame)
    {
        return Err(RegistrationError::InvalidRange(format!(
            "reference frame {} must lie in {}..={} to walk both ways",
            params.reference_frame, params.start_frame, end
        )));
    }
    if params.points.is_empty() {
        return Err(RegistrationError::PointCountMismatch(
            "at least one reference point is required".to_string(),
        ));
    }
    Ok((params.start_frame, end))
}
