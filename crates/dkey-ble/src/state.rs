//! Connection states, adapter status and the externally reported status codes.

// ============================================================================
// Adapter status
// ============================================================================

/// Power/permission status of the local radio adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterStatus {
    /// Not yet reported.
    #[default]
    Unknown,
    /// Adapter is restarting.
    Resetting,
    /// Device has no BLE support.
    Unsupported,
    /// Application lacks radio permission.
    Unauthorized,
    /// Radio is switched off.
    PoweredOff,
    /// Radio is on and usable.
    PoweredOn,
}

/// Whether the radio can be used at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioAvailability {
    /// Scanning and connecting are possible.
    Available,
    /// Any session must be torn down.
    Unavailable,
}

impl AdapterStatus {
    /// Collapse the adapter status to availability.
    pub fn availability(self) -> RadioAvailability {
        match self {
            AdapterStatus::PoweredOn => RadioAvailability::Available,
            _ => RadioAvailability::Unavailable,
        }
    }

    /// Shorthand for `availability() == Available`.
    pub fn is_available(self) -> bool {
        self.availability() == RadioAvailability::Available
    }
}

// ============================================================================
// Reported status
// ============================================================================

/// Status values reported to the application.
///
/// Numeric codes are stable and shared with existing integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleStatus {
    /// Adapter status unknown.
    Unknown,
    /// Adapter resetting.
    Resetting,
    /// BLE unsupported.
    Unsupported,
    /// BLE permission missing.
    Unauthorized,
    /// Adapter off.
    PoweredOff,
    /// Adapter on.
    PoweredOn,
    /// Scan ended without finding the vehicle.
    NotFound,
    /// Link established.
    Connect,
    /// Link could not be established.
    ConnectFail,
    /// Link closed.
    DisConnect,
    /// Link teardown failed.
    DisConnectFail,
    /// Handshake succeeded.
    AuthSuccess,
    /// Handshake failed.
    AuthFail,
}

impl BleStatus {
    /// Numeric status code.
    pub const fn code(self) -> u8 {
        match self {
            BleStatus::Unknown => 0,
            BleStatus::Resetting => 1,
            BleStatus::Unsupported => 2,
            BleStatus::Unauthorized => 3,
            BleStatus::PoweredOff => 4,
            BleStatus::PoweredOn => 5,
            BleStatus::NotFound => 10,
            BleStatus::Connect => 11,
            BleStatus::ConnectFail => 12,
            BleStatus::DisConnect => 13,
            BleStatus::DisConnectFail => 14,
            BleStatus::AuthSuccess => 15,
            BleStatus::AuthFail => 16,
        }
    }

    /// Parse a numeric status code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => BleStatus::Unknown,
            1 => BleStatus::Resetting,
            2 => BleStatus::Unsupported,
            3 => BleStatus::Unauthorized,
            4 => BleStatus::PoweredOff,
            5 => BleStatus::PoweredOn,
            10 => BleStatus::NotFound,
            11 => BleStatus::Connect,
            12 => BleStatus::ConnectFail,
            13 => BleStatus::DisConnect,
            14 => BleStatus::DisConnectFail,
            15 => BleStatus::AuthSuccess,
            16 => BleStatus::AuthFail,
            _ => return None,
        })
    }

    /// Lowercase name, used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            BleStatus::Unknown => "unknown",
            BleStatus::Resetting => "resetting",
            BleStatus::Unsupported => "unsupported",
            BleStatus::Unauthorized => "unauthorized",
            BleStatus::PoweredOff => "powered_off",
            BleStatus::PoweredOn => "powered_on",
            BleStatus::NotFound => "not_found",
            BleStatus::Connect => "connect",
            BleStatus::ConnectFail => "connect_fail",
            BleStatus::DisConnect => "disconnect",
            BleStatus::DisConnectFail => "disconnect_fail",
            BleStatus::AuthSuccess => "auth_success",
            BleStatus::AuthFail => "auth_fail",
        }
    }
}

impl From<AdapterStatus> for BleStatus {
    fn from(status: AdapterStatus) -> Self {
        match status {
            AdapterStatus::Unknown => BleStatus::Unknown,
            AdapterStatus::Resetting => BleStatus::Resetting,
            AdapterStatus::Unsupported => BleStatus::Unsupported,
            AdapterStatus::Unauthorized => BleStatus::Unauthorized,
            AdapterStatus::PoweredOff => BleStatus::PoweredOff,
            AdapterStatus::PoweredOn => BleStatus::PoweredOn,
        }
    }
}

impl std::fmt::Display for BleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Lifecycle of a connection to one vehicle.
///
/// ```text
/// Idle -> Scanning -> Found -> Connecting -> Connected -> Authenticating
///      -> Authenticated -> Disconnecting -> Disconnected
/// ```
///
/// `ConnectFailed`, `AuthFailed` and `DisconnectFailed` end an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Scanning for the vehicle.
    Scanning,
    /// Vehicle peripheral discovered.
    Found,
    /// Link requested.
    Connecting,
    /// Link up, handshake not started.
    Connected,
    /// Handshake in progress.
    Authenticating,
    /// Session key installed.
    Authenticated,
    /// Teardown requested.
    Disconnecting,
    /// Link closed.
    Disconnected,
    /// Link could not be established.
    ConnectFailed,
    /// Handshake failed.
    AuthFailed,
    /// Teardown failed.
    DisconnectFailed,
}

impl ConnectionState {
    /// Status to report when entering this state, if any.
    pub const fn status(self) -> Option<BleStatus> {
        match self {
            ConnectionState::Connected => Some(BleStatus::Connect),
            ConnectionState::ConnectFailed => Some(BleStatus::ConnectFail),
            ConnectionState::Authenticated => Some(BleStatus::AuthSuccess),
            ConnectionState::AuthFailed => Some(BleStatus::AuthFail),
            ConnectionState::Disconnected => Some(BleStatus::DisConnect),
            ConnectionState::DisconnectFailed => Some(BleStatus::DisConnectFail),
            _ => None,
        }
    }

    /// Whether a radio link exists (or is being brought up).
    pub const fn has_link(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }

    /// Whether the state ends an attempt.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::ConnectFailed
                | ConnectionState::AuthFailed
                | ConnectionState::DisconnectFailed
        )
    }

    /// Whether a new scan or connect may start from here.
    pub const fn is_at_rest(self) -> bool {
        matches!(self, ConnectionState::Idle) || self.is_terminal()
    }

    /// Lowercase name, used in logs and errors.
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Found => "found",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ConnectFailed => "connect_failed",
            ConnectionState::AuthFailed => "auth_failed",
            ConnectionState::DisconnectFailed => "disconnect_failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BleStatus::PoweredOn.code(), 5);
        assert_eq!(BleStatus::NotFound.code(), 10);
        assert_eq!(BleStatus::AuthFail.code(), 16);
        for code in 0..=20 {
            if let Some(status) = BleStatus::from_code(code) {
                assert_eq!(status.code(), code);
            }
        }
        assert_eq!(BleStatus::from_code(7), None);
    }

    #[test]
    fn test_adapter_availability() {
        assert!(AdapterStatus::PoweredOn.is_available());
        for status in [
            AdapterStatus::Unknown,
            AdapterStatus::Resetting,
            AdapterStatus::Unsupported,
            AdapterStatus::Unauthorized,
            AdapterStatus::PoweredOff,
        ] {
            assert_eq!(status.availability(), RadioAvailability::Unavailable);
        }
    }

    #[test]
    fn test_reported_states() {
        assert_eq!(ConnectionState::Scanning.status(), None);
        assert_eq!(ConnectionState::Connected.status(), Some(BleStatus::Connect));
        assert_eq!(ConnectionState::Authenticated.status(), Some(BleStatus::AuthSuccess));
        assert!(ConnectionState::AuthFailed.is_at_rest());
        assert!(!ConnectionState::Found.is_at_rest());
        assert!(ConnectionState::Authenticating.has_link());
    }
}
