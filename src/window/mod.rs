//! Temporal window resolver.
//!
//! Expands a single anchor frame into, for every configured field, the
//! values found at a list of time offsets from the anchor, plus a boolean
//! pad mask stored under `<field>_is_pad`. Offsets are matched to the
//! nearest frame of the anchor's episode. A match within `tolerance_s` is a
//! regular value; a miss inside the episode's time span is an error; a miss
//! outside the span is clamped to the boundary frame and flagged as padding.

use crate::buffer::array::FieldArray;
use crate::buffer::layout::{FieldSpec, IS_PAD_POSTFIX};
use crate::error::{BufferError, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Field name to ordered time offsets in seconds.
pub type DeltaTimestamps = BTreeMap<String, Vec<f64>>;

/// Random access to episodic frames in logical order.
pub trait FrameSource {
    fn len(&self) -> usize;

    fn episode_index(&self, logical: usize) -> Result<i64>;

    fn timestamp(&self, logical: usize) -> Result<f64>;

    fn field_spec(&self, field: &str) -> Option<FieldSpec>;

    /// Value of `field` at one frame, shaped like the field spec.
    fn frame_field(&self, field: &str, logical: usize) -> Result<FieldArray>;
}

/// Key under which the pad mask of `field` is exposed.
pub fn pad_key(field: &str) -> String {
    format!("{}{}", field, IS_PAD_POSTFIX)
}

/// The episode surrounding an anchor: its first logical index and the
/// timestamps of all its frames.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSpan {
    pub start: usize,
    pub timestamps: Vec<f64>,
}

impl EpisodeSpan {
    /// Maximal contiguous run of frames sharing the anchor's episode index.
    pub fn around<S: FrameSource + ?Sized>(source: &S, anchor: usize) -> Result<Self> {
        let episode = source.episode_index(anchor)?;
        let mut start = anchor;
        while start > 0 && source.episode_index(start - 1)? == episode {
            start -= 1;
        }
        let mut end = anchor + 1;
        while end < source.len() && source.episode_index(end)? == episode {
            end += 1;
        }
        let timestamps = (start..end)
            .map(|i| source.timestamp(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { start, timestamps })
    }

    pub fn first_ts(&self) -> f64 {
        self.timestamps[0]
    }

    pub fn last_ts(&self) -> f64 {
        self.timestamps[self.timestamps.len() - 1]
    }

    /// Position within the span of the frame closest to `target`; ties go
    /// to the earlier frame. Timestamps are ascending within an episode.
    pub fn nearest(&self, target: f64) -> usize {
        let ts = &self.timestamps;
        let after = ts.partition_point(|&t| t < target);
        if after == 0 {
            return 0;
        }
        if after == ts.len() {
            return ts.len() - 1;
        }
        let before = after - 1;
        if (target - ts[before]).abs() <= (ts[after] - target).abs() {
            before
        } else {
            after
        }
    }
}

/// Outcome of matching one offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffsetMatch {
    /// Frame at span position, within tolerance.
    Matched(usize),
    /// Target outside the episode; clamped to the boundary frame.
    Padded(usize),
    /// Target inside the episode but no frame within tolerance.
    OutOfTolerance { target: f64, nearest: f64, error: f64 },
}

pub fn match_offset(
    span: &EpisodeSpan,
    anchor_ts: f64,
    offset: f64,
    tolerance_s: f64,
) -> OffsetMatch {
    let target = anchor_ts + offset;
    let pos = span.nearest(target);
    let nearest = span.timestamps[pos];
    let error = (nearest - target).abs();
    if error <= tolerance_s {
        OffsetMatch::Matched(pos)
    } else if target < span.first_ts() || target > span.last_ts() {
        OffsetMatch::Padded(pos)
    } else {
        OffsetMatch::OutOfTolerance {
            target,
            nearest,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemporalWindow {
    delta_timestamps: DeltaTimestamps,
    tolerance_s: f64,
}

impl TemporalWindow {
    pub fn new(delta_timestamps: DeltaTimestamps, tolerance_s: f64) -> Result<Self> {
        Self::check_tolerance(tolerance_s)?;
        for (field, offsets) in &delta_timestamps {
            if offsets.is_empty() {
                return Err(BufferError::InvalidConfig(format!(
                    "delta_timestamps for '{}' is empty",
                    field
                )));
            }
            if offsets.iter().any(|d| !d.is_finite()) {
                return Err(BufferError::InvalidConfig(format!(
                    "delta_timestamps for '{}' must be finite",
                    field
                )));
            }
        }
        Ok(Self {
            delta_timestamps,
            tolerance_s,
        })
    }

    fn check_tolerance(tolerance_s: f64) -> Result<()> {
        if !tolerance_s.is_finite() || tolerance_s < 0.0 {
            return Err(BufferError::InvalidConfig(format!(
                "tolerance_s must be finite and non-negative, got {}",
                tolerance_s
            )));
        }
        Ok(())
    }

    pub fn delta_timestamps(&self) -> &DeltaTimestamps {
        &self.delta_timestamps
    }

    pub fn tolerance_s(&self) -> f64 {
        self.tolerance_s
    }

    pub fn set_tolerance_s(&mut self, tolerance_s: f64) -> Result<()> {
        Self::check_tolerance(tolerance_s)?;
        self.tolerance_s = tolerance_s;
        Ok(())
    }

    /// Resolve every configured field around `anchor`.
    ///
    /// Returns, per field, the stacked values (`[n_offsets, ..shape]`) under
    /// the field name and the pad mask under `pad_key(field)`. Any in-episode
    /// offset that misses the tolerance fails the whole resolution.
    pub fn resolve<S: FrameSource + ?Sized>(
        &self,
        source: &S,
        anchor: usize,
    ) -> Result<BTreeMap<String, FieldArray>> {
        if anchor >= source.len() {
            return Err(BufferError::Index {
                index: anchor as i64,
                len: source.len(),
            });
        }
        let span = EpisodeSpan::around(source, anchor)?;
        let anchor_ts = source.timestamp(anchor)?;

        let mut out = BTreeMap::new();
        for (field, offsets) in &self.delta_timestamps {
            let spec = source
                .field_spec(field)
                .ok_or_else(|| BufferError::UnknownField(field.clone()))?;

            let mut data = Vec::with_capacity(offsets.len() * spec.stride());
            let mut is_pad = Vec::with_capacity(offsets.len());
            for &offset in offsets {
                let pos = match match_offset(&span, anchor_ts, offset, self.tolerance_s) {
                    OffsetMatch::Matched(pos) => {
                        is_pad.push(false);
                        pos
                    }
                    OffsetMatch::Padded(pos) => {
                        is_pad.push(true);
                        pos
                    }
                    OffsetMatch::OutOfTolerance {
                        target,
                        nearest,
                        error,
                    } => {
                        warn!(
                            field = field.as_str(),
                            anchor,
                            target,
                            nearest,
                            error,
                            tolerance = self.tolerance_s,
                            "Requested timestamp outside tolerance inside episode range"
                        );
                        return Err(BufferError::TimestampOutsideTolerance {
                            field: field.clone(),
                            target,
                            nearest,
                            error,
                            tolerance: self.tolerance_s,
                        });
                    }
                };
                let value = source.frame_field(field, span.start + pos)?;
                data.extend_from_slice(value.as_bytes());
            }

            let mut shape = Vec::with_capacity(spec.shape.len() + 1);
            shape.push(offsets.len());
            shape.extend_from_slice(&spec.shape);
            out.insert(field.clone(), FieldArray::from_bytes(spec.dtype, shape, data)?);
            out.insert(pad_key(field), FieldArray::from_vec(is_pad));
        }
        debug!(anchor, fields = self.delta_timestamps.len(), "Resolved temporal window");
        Ok(out)
    }
}
