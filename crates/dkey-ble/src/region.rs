//! Geofence region monitor driving proactive wake-up.

/// Position of the device relative to the vehicle's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegionState {
    /// Not yet determined.
    #[default]
    Unknown,
    /// Inside the region.
    Inside,
    /// Outside the region.
    Outside,
}

impl RegionState {
    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            RegionState::Unknown => "unknown",
            RegionState::Inside => "inside",
            RegionState::Outside => "outside",
        }
    }
}

/// A region transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChange {
    /// New region state.
    pub state: RegionState,
    /// Whether a wake-up should be attempted.
    pub wake: bool,
}

/// Tracks region state and decides when entering should wake the vehicle.
#[derive(Debug, Default)]
pub struct RegionMonitor {
    state: RegionState,
    auto_wake: bool,
}

impl RegionMonitor {
    /// Create a monitor with auto-wake off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn auto-wake on or off.
    pub fn set_auto_wake(&mut self, enabled: bool) {
        self.auto_wake = enabled;
    }

    /// Whether auto-wake is on.
    pub fn auto_wake(&self) -> bool {
        self.auto_wake
    }

    /// Current region state.
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// Record a region report. Returns `None` if nothing changed.
    ///
    /// Leaving the region never asks for a disconnect.
    pub fn on_region(&mut self, state: RegionState) -> Option<RegionChange> {
        if state == self.state {
            return None;
        }
        self.state = state;
        Some(RegionChange {
            state,
            wake: self.auto_wake && state == RegionState::Inside,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only() {
        let mut monitor = RegionMonitor::new();
        assert_eq!(monitor.on_region(RegionState::Unknown), None);
        assert_eq!(
            monitor.on_region(RegionState::Inside),
            Some(RegionChange {
                state: RegionState::Inside,
                wake: false
            })
        );
        assert_eq!(monitor.on_region(RegionState::Inside), None);
    }

    #[test]
    fn test_wake_on_enter() {
        let mut monitor = RegionMonitor::new();
        monitor.set_auto_wake(true);
        assert!(monitor.on_region(RegionState::Inside).unwrap().wake);
        assert!(!monitor.on_region(RegionState::Outside).unwrap().wake);
        assert!(monitor.on_region(RegionState::Inside).unwrap().wake);
    }
}
