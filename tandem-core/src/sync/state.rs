//! Playback State Machine

use serde::{Deserialize, Serialize};

/// Longest lead-in accepted for a scheduled start
pub const MAX_DELAY_MS: i64 = 60 * 60 * 1000;

/// Furthest position a seek can jump to
pub const MAX_POSITION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Authoritative playback state, on the reference clock.
///
/// While playing, the stream position at reference time `t` is
/// `t - start_time`. Otherwise the position is `elapsed_ms`, frozen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Whether the stream is (scheduled to be) running
    pub is_playing: bool,
    /// Reference instant at which position 0 played (or would have)
    pub start_time: i64,
    /// Frozen position while paused, resume baseline otherwise
    pub elapsed_ms: i64,
}

/// Coarse classification of a playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Stopped,
    Paused,
    Playing,
}

impl PlaybackState {
    /// The state everything starts from and returns to on stop
    pub const STOPPED: PlaybackState = PlaybackState {
        is_playing: false,
        start_time: 0,
        elapsed_ms: 0,
    };

    pub fn phase(&self) -> PlaybackPhase {
        if self.is_playing {
            PlaybackPhase::Playing
        } else if self.elapsed_ms == 0 {
            PlaybackPhase::Stopped
        } else {
            PlaybackPhase::Paused
        }
    }

    /// Stream position at reference time `now_ms`.
    ///
    /// Negative while a scheduled start is still ahead.
    pub fn position_at(&self, now_ms: i64) -> i64 {
        if self.is_playing {
            now_ms.saturating_sub(self.start_time)
        } else {
            self.elapsed_ms
        }
    }

    /// Start (or resume) so that the stream reaches `elapsed_ms` after `delay_ms`
    pub fn play(&self, now_ms: i64, delay_ms: i64) -> PlaybackState {
        let delay_ms = delay_ms.clamp(0, MAX_DELAY_MS);
        PlaybackState {
            is_playing: true,
            start_time: now_ms.saturating_add(delay_ms).saturating_sub(self.elapsed_ms),
            elapsed_ms: self.elapsed_ms,
        }
    }

    /// Freeze the current position. `None` if not playing.
    pub fn pause(&self, now_ms: i64) -> Option<PlaybackState> {
        if !self.is_playing {
            return None;
        }
        Some(PlaybackState {
            is_playing: false,
            start_time: self.start_time,
            elapsed_ms: now_ms.saturating_sub(self.start_time),
        })
    }

    /// Jump to `position_ms`, keeping the play/pause status
    pub fn seek(&self, now_ms: i64, position_ms: i64) -> PlaybackState {
        let position_ms = position_ms.clamp(0, MAX_POSITION_MS);
        if self.is_playing {
            PlaybackState {
                is_playing: true,
                start_time: now_ms.saturating_sub(position_ms),
                elapsed_ms: position_ms,
            }
        } else {
            PlaybackState {
                is_playing: false,
                start_time: 0,
                elapsed_ms: position_ms,
            }
        }
    }

    pub fn stop(&self) -> PlaybackState {
        Self::STOPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_initial_state_is_stopped() {
        let state = PlaybackState::default();
        assert_eq!(state, PlaybackState::STOPPED);
        assert_eq!(state.phase(), PlaybackPhase::Stopped);
        assert_eq!(state.position_at(NOW), 0);
    }

    #[test]
    fn test_play_from_stopped_starts_after_delay() {
        let state = PlaybackState::STOPPED.play(NOW, 2000);
        assert!(state.is_playing);
        assert_eq!(state.start_time, NOW + 2000);
        assert_eq!(state.position_at(NOW), -2000);
        assert_eq!(state.position_at(NOW + 2000), 0);
    }

    #[test]
    fn test_pause_then_play_resumes_at_paused_position() {
        let playing = PlaybackState::STOPPED.play(NOW, 0);
        let paused = playing.pause(NOW + 12_345).unwrap();
        assert_eq!(paused.phase(), PlaybackPhase::Paused);
        assert_eq!(paused.elapsed_ms, 12_345);

        // Resume later with a 2s lead-in
        let later = NOW + 60_000;
        let resumed = paused.play(later, 2000);
        assert_eq!(resumed.start_time, later + 2000 - 12_345);
        assert_eq!(resumed.position_at(later + 2000), 12_345);
    }

    #[test]
    fn test_pause_when_not_playing_is_noop() {
        assert!(PlaybackState::STOPPED.pause(NOW).is_none());

        let paused = PlaybackState::STOPPED.play(NOW, 0).pause(NOW + 10).unwrap();
        assert!(paused.pause(NOW + 20).is_none());
    }

    #[test]
    fn test_seek_while_playing_keeps_playing_from_new_point() {
        let playing = PlaybackState::STOPPED.play(NOW, 0);
        let seeked = playing.seek(NOW + 5_000, 30_000);
        assert!(seeked.is_playing);
        assert_eq!(seeked.position_at(NOW + 5_000), 30_000);
        assert_eq!(seeked.position_at(NOW + 6_000), 31_000);
    }

    #[test]
    fn test_seek_while_paused_moves_resume_point() {
        let paused = PlaybackState::STOPPED.play(NOW, 0).pause(NOW + 1_000).unwrap();
        let seeked = paused.seek(NOW + 2_000, 45_000);
        assert!(!seeked.is_playing);
        assert_eq!(seeked.start_time, 0);
        assert_eq!(seeked.position_at(NOW + 9_999), 45_000);

        let resumed = seeked.play(NOW + 3_000, 2000);
        assert_eq!(resumed.position_at(NOW + 5_000), 45_000);
    }

    #[test]
    fn test_negative_inputs_are_clamped() {
        let state = PlaybackState::STOPPED.seek(NOW, -500);
        assert_eq!(state.elapsed_ms, 0);

        let state = PlaybackState::STOPPED.play(NOW, -2000);
        assert_eq!(state.start_time, NOW);
    }

    #[test]
    fn test_extreme_inputs_are_bounded() {
        let state = PlaybackState::STOPPED.play(NOW, i64::MAX);
        assert_eq!(state.start_time, NOW + MAX_DELAY_MS);

        let seeked = state.seek(NOW, i64::MAX);
        assert_eq!(seeked.elapsed_ms, MAX_POSITION_MS);
        assert_eq!(seeked.position_at(NOW + 10), MAX_POSITION_MS + 10);

        let paused = PlaybackState::STOPPED.seek(NOW, i64::MAX);
        assert_eq!(paused.position_at(NOW), MAX_POSITION_MS);
        assert_eq!(paused.play(NOW, i64::MAX).position_at(NOW + MAX_DELAY_MS), MAX_POSITION_MS);
    }

    #[test]
    fn test_position_math_saturates() {
        let state = PlaybackState {
            is_playing: true,
            start_time: i64::MIN,
            elapsed_ms: 0,
        };
        assert_eq!(state.position_at(NOW), i64::MAX);
        assert_eq!(state.pause(NOW).map(|s| s.elapsed_ms), Some(i64::MAX));

        let state = PlaybackState {
            is_playing: false,
            start_time: 0,
            elapsed_ms: i64::MAX,
        };
        assert!(state.play(i64::MAX, MAX_DELAY_MS).is_playing);
    }

    #[test]
    fn test_stop_always_resets() {
        let states = [
            PlaybackState::STOPPED,
            PlaybackState::STOPPED.play(NOW, 2000),
            PlaybackState::STOPPED.play(NOW, 0).pause(NOW + 700).unwrap(),
            PlaybackState::STOPPED.seek(NOW, 9_000),
        ];
        for state in states {
            assert_eq!(
                state.stop(),
                PlaybackState {
                    is_playing: false,
                    start_time: 0,
                    elapsed_ms: 0
                }
            );
        }
    }
}
