//! Retry & Recovery Policy
//!
//! Classifies a link-down event into the action the controller takes next.
//! Branches are evaluated in priority order:
//!
//! 1. a pending pause is satisfied, nothing else runs
//! 2. negotiation timeout falls back to the next endpoint
//! 3. a reconnect request schedules a delayed reconnection
//! 4. authentication failure goes to the recovery hook, if any
//! 5. anything else terminates

use crate::error::TunnelError;
use serde::{Deserialize, Serialize};

/// What happens after the link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Satisfy the pending pause and keep the session
    CompletePause,
    /// Advance the endpoint, then reconnect
    FallbackAndReconnect,
    /// Reconnect to the same endpoint after the reconnection delay
    Reconnect,
    /// Pass control to the authentication recovery hook
    HandOffToHook,
    /// Tear down and report
    Terminate,
}

/// Facts the policy looks at
#[derive(Debug, Clone, Copy)]
pub struct LinkDown<'a> {
    pub error: Option<&'a TunnelError>,
    pub pause_pending: bool,
    pub should_reconnect: bool,
    pub has_auth_hook: bool,
}

pub fn classify(link_down: &LinkDown<'_>) -> Recovery {
    if link_down.pause_pending {
        return Recovery::CompletePause;
    }

    // UDP is connectionless: a negotiation timeout stands in for a link timeout
    if link_down.error.is_some_and(|e| e.is_negotiation_timeout()) {
        return Recovery::FallbackAndReconnect;
    }

    if link_down.should_reconnect {
        return Recovery::Reconnect;
    }

    if link_down.has_auth_hook && link_down.error.is_some_and(|e| e.is_authentication_failure()) {
        return Recovery::HandOffToHook;
    }

    Recovery::Terminate
}

/// The error that explains a link shutdown.
///
/// The session's stop error wins; a transport failure without one becomes
/// [`TunnelError::LinkError`].
pub fn shutdown_error(
    session_error: Option<TunnelError>,
    had_failure: bool,
) -> Option<TunnelError> {
    match session_error {
        Some(error) => Some(error),
        None if had_failure => Some(TunnelError::LinkError),
        None => None,
    }
}

/// Upgraded links are only taken over after transport-level failures.
pub fn allows_upgrade(error: Option<&TunnelError>) -> bool {
    !error.is_some_and(|e| e.is_protocol_level())
}

/// Reaction to "better path available" notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetterPathPolicy {
    /// Renegotiate on every notification, even if the new path is flagged
    /// as possibly not viable
    #[default]
    AlwaysRenegotiate,
    /// Ignore notifications whose path is flagged as not viable
    RequireViablePath,
}

impl BetterPathPolicy {
    pub fn should_renegotiate(&self, viable: bool) -> bool {
        match self {
            BetterPathPolicy::AlwaysRenegotiate => true,
            BetterPathPolicy::RequireViablePath => viable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    fn link_down(error: Option<&TunnelError>) -> LinkDown<'_> {
        LinkDown {
            error,
            pause_pending: false,
            should_reconnect: false,
            has_auth_hook: false,
        }
    }

    #[test]
    fn test_pause_wins() {
        let timeout = TunnelError::Session(SessionError::NegotiationTimeout);
        let ctx = LinkDown {
            pause_pending: true,
            should_reconnect: true,
            ..link_down(Some(&timeout))
        };
        assert_eq!(classify(&ctx), Recovery::CompletePause);
    }

    #[test]
    fn test_negotiation_timeout_falls_back() {
        let timeout = TunnelError::Session(SessionError::NegotiationTimeout);
        assert_eq!(classify(&link_down(Some(&timeout))), Recovery::FallbackAndReconnect);
    }

    #[test]
    fn test_reconnect() {
        let changed = TunnelError::NetworkChanged;
        let ctx = LinkDown {
            should_reconnect: true,
            ..link_down(Some(&changed))
        };
        assert_eq!(classify(&ctx), Recovery::Reconnect);
    }

    #[test]
    fn test_auth_failure() {
        let auth = TunnelError::Session(SessionError::AuthenticationFailed);
        assert_eq!(classify(&link_down(Some(&auth))), Recovery::Terminate);

        let ctx = LinkDown {
            has_auth_hook: true,
            ..link_down(Some(&auth))
        };
        assert_eq!(classify(&ctx), Recovery::HandOffToHook);

        // A pending reconnection takes precedence over the hook
        let ctx = LinkDown {
            has_auth_hook: true,
            should_reconnect: true,
            ..link_down(Some(&auth))
        };
        assert_eq!(classify(&ctx), Recovery::Reconnect);
    }

    #[test]
    fn test_terminate() {
        assert_eq!(classify(&link_down(None)), Recovery::Terminate);
        assert_eq!(classify(&link_down(Some(&TunnelError::LinkError))), Recovery::Terminate);
    }

    #[test]
    fn test_shutdown_error() {
        assert_eq!(shutdown_error(None, false), None);
        assert_eq!(shutdown_error(None, true), Some(TunnelError::LinkError));
        assert_eq!(
            shutdown_error(Some(TunnelError::NetworkChanged), true),
            Some(TunnelError::NetworkChanged)
        );
    }

    #[test]
    fn test_allows_upgrade() {
        assert!(allows_upgrade(None));
        assert!(allows_upgrade(Some(&TunnelError::LinkError)));
        let protocol = TunnelError::Session(SessionError::Protocol("bad tls".into()));
        assert!(!allows_upgrade(Some(&protocol)));
    }

    #[test]
    fn test_better_path_policy() {
        assert!(BetterPathPolicy::AlwaysRenegotiate.should_renegotiate(false));
        assert!(BetterPathPolicy::RequireViablePath.should_renegotiate(true));
        assert!(!BetterPathPolicy::RequireViablePath.should_renegotiate(false));
    }
}
