//! Tracking state machine as described in ORB-SLAM3.

/// State of the tracking thread.
///
/// The discriminants are the numeric codes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum TrackingState {
    /// `initialize` has not been called, or the system was shut down.
    SystemNotReady = -1,
    /// Waiting for the first frame after `initialize` or `reset`.
    NoImagesYet = 0,
    /// Frames arrive but no map has been built yet.
    NotInitialized = 1,
    /// Tracking successfully.
    Ok = 2,
    /// Lost tracking recently, attempting recovery.
    RecentlyLost = 3,
    /// Completely lost, need relocalization or a new map.
    Lost = 4,
}

impl TrackingState {
    pub fn code(self) -> i8 {
        self as i8
    }

    /// Inverse of [`TrackingState::code`].
    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            -1 => Self::SystemNotReady,
            0 => Self::NoImagesYet,
            1 => Self::NotInitialized,
            2 => Self::Ok,
            3 => Self::RecentlyLost,
            4 => Self::Lost,
            _ => return None,
        })
    }

    pub fn is_lost(self) -> bool {
        matches!(self, Self::Lost | Self::RecentlyLost)
    }
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::SystemNotReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for state in [
            TrackingState::SystemNotReady,
            TrackingState::NoImagesYet,
            TrackingState::NotInitialized,
            TrackingState::Ok,
            TrackingState::RecentlyLost,
            TrackingState::Lost,
        ] {
            assert_eq!(TrackingState::from_code(state.code()), Some(state));
        }
        assert_eq!(TrackingState::Ok.code(), 2);
        assert_eq!(TrackingState::from_code(9), None);
    }

    #[test]
    fn test_is_lost() {
        assert!(TrackingState::Lost.is_lost());
        assert!(TrackingState::RecentlyLost.is_lost());
        assert!(!TrackingState::Ok.is_lost());
    }
}
