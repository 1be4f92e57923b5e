use serde::{Deserialize, Serialize};

use crate::frame_info::GameInput;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

const DEFAULT_FRAME_WINDOW_SIZE: usize = 40;
const DEFAULT_INPUT_WINDOW_SIZE: usize = 10;
const DEFAULT_MIN_FRAME_ADVANTAGE: u32 = 3;
const DEFAULT_MAX_FRAME_ADVANTAGE: u32 = 9;

/// Tuning for the frame-advantage averaging that drives wait recommendations.
///
/// # Example
///
/// ```
/// use rampart_rollback::TimeSyncConfig;
///
/// let config = TimeSyncConfig {
///     min_frame_advantage: 2,
///     ..TimeSyncConfig::lan()
/// };
/// assert_eq!(config.window_size, 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncConfig {
    /// Number of frames of advantage samples to average.
    pub window_size: usize,
    /// Number of recent inputs checked when idle input is required.
    pub input_window_size: usize,
    /// Recommendations below this many frames are treated as noise.
    pub min_frame_advantage: u32,
    /// Upper bound on a single recommendation.
    pub max_frame_advantage: u32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
            input_window_size: DEFAULT_INPUT_WINDOW_SIZE,
            min_frame_advantage: DEFAULT_MIN_FRAME_ADVANTAGE,
            max_frame_advantage: DEFAULT_MAX_FRAME_ADVANTAGE,
        }
    }
}

impl TimeSyncConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Short window: reacts quickly to drift, but is noisier.
    #[must_use]
    pub fn responsive() -> Self {
        Self {
            window_size: 20,
            ..Self::default()
        }
    }

    /// Long window: only corrects sustained drift.
    #[must_use]
    pub fn smooth() -> Self {
        Self {
            window_size: 80,
            ..Self::default()
        }
    }

    /// For low-jitter links where small corrections are worth making.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            window_size: 20,
            min_frame_advantage: 1,
            max_frame_advantage: 5,
            ..Self::default()
        }
    }
}

/// Rolling averages of local and remote frame advantage for one peer.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    last_inputs: Vec<GameInput>,
    min_frame_advantage: u32,
    max_frame_advantage: u32,
    iteration: u64,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        let input_window_size = config.input_window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            last_inputs: vec![GameInput::default(); input_window_size],
            min_frame_advantage: config.min_frame_advantage,
            max_frame_advantage: config.max_frame_advantage,
            iteration: 0,
        }
    }

    /// Records the advantages observed when `input` was sent.
    pub fn advance_frame(&mut self, input: &GameInput, local_adv: i32, remote_adv: i32) {
        let frame = input.frame;
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "TimeSync::advance_frame called with invalid frame {}, skipping update",
                frame
            );
            return;
        }
        let index = frame.as_i32() as usize;
        let inputs_len = self.last_inputs.len();
        self.last_inputs[index % inputs_len] = *input;
        let window = self.local.len();
        self.local[index % window] = local_adv;
        self.remote[index % window] = remote_adv;
    }

    /// Number of frames this peer should wait so the other side can catch up.
    ///
    /// Only the peer that both sides agree is ahead slows down, and it only closes half the gap
    /// because the other peer is simultaneously speeding up relative to it.
    pub fn recommend_frame_wait_duration(&mut self, require_idle_input: bool) -> u32 {
        self.iteration += 1;

        let local_avg = mean(&self.local);
        let remote_avg = mean(&self.remote);

        if local_avg >= remote_avg {
            return 0;
        }

        let sleep_frames = ((remote_avg - local_avg) / 2.0).round() as u32;
        tracing::trace!(
            iteration = self.iteration,
            local_avg,
            remote_avg,
            sleep_frames,
            "time sync recommendation"
        );

        if sleep_frames < self.min_frame_advantage {
            return 0;
        }

        if require_idle_input {
            if let Some((first, rest)) = self.last_inputs.split_first() {
                if let Some(position) = rest.iter().position(|input| !input.equal(first, true)) {
                    tracing::trace!(
                        iteration = self.iteration,
                        position = position + 1,
                        "rejecting wait recommendation, input not idle"
                    );
                    return 0;
                }
            }
        }

        sleep_frames.min(self.max_frame_advantage)
    }

    /// Mean of remote minus local advantage halved, without thresholds. Used for stats.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        ((mean(&self.remote) - mean(&self.local)) / 2.0) as i32
    }
}

fn mean(samples: &[i32]) -> f32 {
    let sum: i64 = samples.iter().map(|&s| i64::from(s)).sum();
    sum as f32 / samples.len().max(1) as f32
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod time_sync_tests {
    use super::*;
    use crate::Frame;

    fn input(frame: i32, value: u8) -> GameInput {
        GameInput::new(Frame::new(frame), &[value]).unwrap()
    }

    fn fill(time_sync: &mut TimeSync, local_adv: i32, remote_adv: i32) {
        for i in 0..80 {
            time_sync.advance_frame(&input(i, 0), local_adv, remote_adv);
        }
    }

    #[test]
    fn test_no_advantage_recommends_nothing() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0, 0);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
        assert_eq!(time_sync.average_frame_advantage(), 0);
    }

    #[test]
    fn test_local_ahead_means_other_peer_waits() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 5, -5);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_remote_ten_ahead_recommends_five() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0, 10);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 5);
        assert_eq!(time_sync.average_frame_advantage(), 5);
    }

    #[test]
    fn test_small_advantage_is_noise() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0, 4);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_recommendation_is_clamped() {
        let mut time_sync = TimeSync::with_config(TimeSyncConfig {
            max_frame_advantage: 4,
            ..TimeSyncConfig::default()
        });
        fill(&mut time_sync, 0, 10);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 4);
    }

    #[test]
    fn test_rounding_half_up() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0, 7);
        // (7 - 0) / 2 = 3.5
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 4);
    }

    #[test]
    fn test_idle_input_requirement() {
        let mut time_sync = TimeSync::default();
        for i in 0..80 {
            time_sync.advance_frame(&input(i, (i % 3) as u8), 0, 10);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(true), 0);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 5);

        for i in 80..100 {
            time_sync.advance_frame(&input(i, 1), 0, 10);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(true), 5);
    }

    #[test]
    fn test_invalid_frame_is_ignored() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(&GameInput::default(), 100, 100);
        assert_eq!(time_sync.average_frame_advantage(), 0);
    }

    #[test]
    fn test_iteration_counter_is_per_instance() {
        let mut a = TimeSync::default();
        let mut b = TimeSync::default();
        a.recommend_frame_wait_duration(false);
        a.recommend_frame_wait_duration(false);
        b.recommend_frame_wait_duration(false);
        assert_eq!(a.iteration, 2);
        assert_eq!(b.iteration, 1);
    }
}
