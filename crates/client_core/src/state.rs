use std::fmt;

use shared::{
    domain::ConnectionId,
    error::{ApiError, ErrorCode},
};

/// What ended (or is ending) a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectSource {
    UserInitiated,
    /// The app stayed in the background past its keepalive window.
    SystemInitiated,
    ConnectivityLost,
    NoPongReceived,
    TransportError(String),
    ServerInitiated(ApiError),
    AuthenticationFailed,
}

impl DisconnectSource {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, Self::UserInitiated)
    }

    /// Whether the recovery loop should bring the connection back on its own.
    ///
    /// Connectivity loss is excluded: reconnection waits for the restore signal.
    pub fn should_reconnect(&self) -> bool {
        match self {
            Self::NoPongReceived | Self::TransportError(_) => true,
            Self::ServerInitiated(error) => {
                matches!(error.code, ErrorCode::Internal | ErrorCode::RateLimited)
            }
            Self::UserInitiated
            | Self::SystemInitiated
            | Self::ConnectivityLost
            | Self::AuthenticationFailed => false,
        }
    }
}

impl fmt::Display for DisconnectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserInitiated => f.write_str("disconnected by user"),
            Self::SystemInitiated => f.write_str("disconnected by system"),
            Self::ConnectivityLost => f.write_str("network connectivity lost"),
            Self::NoPongReceived => f.write_str("no heartbeat acknowledgement received"),
            Self::TransportError(message) => write!(f, "transport error: {message}"),
            Self::ServerInitiated(error) => {
                write!(f, "closed by server ({:?}): {}", error.code, error.message)
            }
            Self::AuthenticationFailed => f.write_str("authentication failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectCause {
    TokenExpired,
    TransportFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected(Option<DisconnectSource>),
    Connecting,
    WaitingForConnectionId,
    Connected(ConnectionId),
    Reconnecting(ReconnectCause),
    Disconnecting(DisconnectSource),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected(None)
    }
}

impl ConnectionState {
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Self::Connected(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Edges of the connection state graph. Everything not listed is illegal.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected(_), Connecting) | (Reconnecting(_), Connecting) => true,
            (Disconnected(_), Reconnecting(ReconnectCause::TransportFailure)) => true,
            (Connecting, WaitingForConnectionId) => true,
            (WaitingForConnectionId, Connected(_)) => true,
            (
                Connecting | WaitingForConnectionId | Connected(_),
                Reconnecting(ReconnectCause::TokenExpired),
            ) => true,
            // An explicit disconnect replaces a pending automatic-reconnect reason.
            (Disconnected(Some(current)), Disconnected(Some(DisconnectSource::UserInitiated))) => {
                !current.is_user_initiated()
            }
            (Disconnected(_), Disconnecting(_) | Disconnected(_)) => false,
            (Disconnecting(_), Disconnecting(_)) => false,
            (_, Disconnecting(_) | Disconnected(_)) => true,
            _ => false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected(None) => ConnectionStatus::Initialized,
            Self::Disconnected(Some(source)) if source.should_reconnect() => {
                ConnectionStatus::Connecting
            }
            Self::Disconnected(Some(source)) => ConnectionStatus::Disconnected {
                error: (!source.is_user_initiated()).then(|| source.to_string()),
            },
            Self::Connecting | Self::WaitingForConnectionId | Self::Reconnecting(_) => {
                ConnectionStatus::Connecting
            }
            Self::Connected(_) => ConnectionStatus::Connected,
            Self::Disconnecting(_) => ConnectionStatus::Disconnecting,
        }
    }
}

/// Coarse status for presentation layers. Transient retries show as `Connecting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}
