//! Sampling weights mixing an offline dataset with the online buffer.

use crate::buffer::DataBuffer;
use crate::error::SamplerError;
use std::ops::Range;

/// A pool of samples grouped into episodes.
pub trait SamplePool {
    fn num_samples(&self) -> usize;

    /// Positional ranges of each episode, in the pool's own order.
    fn episode_ranges(&self) -> Result<Vec<Range<usize>>, SamplerError>;
}

/// Per-episode `[from, to)` boundaries of a static dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeDataIndex {
    pub from: Vec<usize>,
    pub to: Vec<usize>,
}

impl EpisodeDataIndex {
    pub fn new(from: Vec<usize>, to: Vec<usize>) -> Self {
        Self { from, to }
    }

    /// Boundaries of the contiguous runs in a per-sample episode index column.
    pub fn from_episode_indices(episode_indices: &[i64]) -> Self {
        let mut index = Self::default();
        for (i, ep) in episode_indices.iter().enumerate() {
            if i == 0 || episode_indices[i - 1] != *ep {
                if i > 0 {
                    index.to.push(i);
                }
                index.from.push(i);
            }
        }
        if !episode_indices.is_empty() {
            index.to.push(episode_indices.len());
        }
        index
    }

    pub fn ranges(&self) -> Vec<Range<usize>> {
        self.from
            .iter()
            .zip(&self.to)
            .map(|(&from, &to)| from..to)
            .collect()
    }
}

/// Static dataset described by its size and episode boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflinePool {
    pub num_samples: usize,
    pub episode_data_index: EpisodeDataIndex,
}

impl OfflinePool {
    pub fn new(num_samples: usize, episode_data_index: EpisodeDataIndex) -> Self {
        Self {
            num_samples,
            episode_data_index,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl SamplePool for OfflinePool {
    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn episode_ranges(&self) -> Result<Vec<Range<usize>>, SamplerError> {
        Ok(self.episode_data_index.ranges())
    }
}

impl SamplePool for DataBuffer {
    fn num_samples(&self) -> usize {
        self.len()
    }

    fn episode_ranges(&self) -> Result<Vec<Range<usize>>, SamplerError> {
        Ok(DataBuffer::episode_ranges(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingConfig {
    /// Share of total mass assigned to the online pool, in `[0, 1]`.
    pub online_sampling_ratio: f64,
    pub offline_drop_n_last_frames: usize,
    pub online_drop_n_last_frames: usize,
}

impl MixingConfig {
    pub fn new(online_sampling_ratio: f64) -> Self {
        Self {
            online_sampling_ratio,
            offline_drop_n_last_frames: 0,
            online_drop_n_last_frames: 0,
        }
    }

    pub fn offline_drop_n_last_frames(mut self, n: usize) -> Self {
        self.offline_drop_n_last_frames = n;
        self
    }

    pub fn online_drop_n_last_frames(mut self, n: usize) -> Self {
        self.online_drop_n_last_frames = n;
        self
    }
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Which samples of a pool may be drawn: all but the last `drop_n_last_frames`
/// of every episode.
fn retained_mask<P: SamplePool + ?Sized>(
    pool: &P,
    drop_n_last_frames: usize,
) -> Result<Vec<bool>, SamplerError> {
    let n = pool.num_samples();
    let mut mask = vec![true; n];
    if drop_n_last_frames == 0 {
        return Ok(mask);
    }
    for range in pool.episode_ranges()? {
        let end = range.end.min(n);
        let start = range.start.min(end);
        let cut = end.saturating_sub(drop_n_last_frames).max(start);
        mask[cut..end].iter_mut().for_each(|m| *m = false);
    }
    Ok(mask)
}

/// Spread `mass` uniformly over the retained samples.
fn spread(mask: &[bool], mass: f64) -> Vec<f64> {
    let retained = mask.iter().filter(|&&m| m).count();
    mask.iter()
        .map(|&m| if m && retained > 0 { mass / retained as f64 } else { 0.0 })
        .collect()
}

/// Weights for every sample: offline pool first, then the online pool.
///
/// With both pools holding retained samples, the online pool receives
/// `online_sampling_ratio` of the mass and the offline pool the rest. A pool
/// with nothing to draw gives all the mass to the other one. Within a pool
/// the mass is uniform over retained samples; dropped samples weigh 0. The
/// result sums to 1.
pub fn compute_sampler_weights<Off, On>(
    offline: &Off,
    online: &On,
    config: &MixingConfig,
) -> Result<Vec<f64>, SamplerError>
where
    Off: SamplePool + ?Sized,
    On: SamplePool + ?Sized,
{
    let ratio = config.online_sampling_ratio;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(SamplerError::InvalidRatio(ratio));
    }
    if offline.num_samples() == 0 && online.num_samples() == 0 {
        return Err(SamplerError::BothPoolsEmpty);
    }

    let offline_mask = retained_mask(offline, config.offline_drop_n_last_frames)?;
    let online_mask = retained_mask(online, config.online_drop_n_last_frames)?;
    let offline_live = offline_mask.iter().any(|&m| m);
    let online_live = online_mask.iter().any(|&m| m);

    let online_mass = match (offline_live, online_live) {
        (true, true) => ratio,
        (true, false) => 0.0,
        (false, true) => 1.0,
        (false, false) => return Err(SamplerError::NoRetainedSamples),
    };

    let mut weights = spread(&offline_mask, 1.0 - online_mass);
    weights.extend(spread(&online_mask, online_mass));
    Ok(weights)
}
