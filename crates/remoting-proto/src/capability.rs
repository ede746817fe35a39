//! Optional protocol features announced at channel construction

use serde::{Deserialize, Serialize};
use std::fmt;

/// Feature bitset exchanged as the first command on the wire.
///
/// Both peers announce what they support and then operate on the
/// intersection, which stays fixed for the lifetime of the channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(pub u64);

impl Capability {
    /// No optional features
    pub const NONE: Self = Self(0);
    /// Class fetches answer with the defining loader as well as the image
    pub const MULTI_LOADER_RPC: Self = Self(1);
    /// Pipe writers are throttled by reader acknowledgements
    pub const PIPE_FLOW_CONTROL: Self = Self(2);

    /// Everything this implementation knows about
    pub const fn current() -> Self {
        Self(Self::MULTI_LOADER_RPC.0 | Self::PIPE_FLOW_CONTROL.0)
    }

    /// Check if a feature is set
    pub fn has(self, feature: Capability) -> bool {
        (self.0 & feature.0) == feature.0
    }

    /// Return a copy with the feature added
    pub fn with(self, feature: Capability) -> Self {
        Self(self.0 | feature.0)
    }

    /// Return a copy with the feature removed
    pub fn without(self, feature: Capability) -> Self {
        Self(self.0 & !feature.0)
    }

    /// Feature set both peers can use
    pub fn negotiate(self, remote: Capability) -> Self {
        Self(self.0 & remote.0)
    }

    /// Whether multi-loader class fetches are in use
    pub fn supports_multi_loader_rpc(self) -> bool {
        self.has(Self::MULTI_LOADER_RPC)
    }

    /// Whether pipes are flow controlled
    pub fn supports_pipe_flow_control(self) -> bool {
        self.has(Self::PIPE_FLOW_CONTROL)
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.supports_multi_loader_rpc() {
            names.push("MULTI_LOADER_RPC");
        }
        if self.supports_pipe_flow_control() {
            names.push("PIPE_FLOW_CONTROL");
        }
        let unknown = self.0 & !Self::current().0;
        if unknown != 0 {
            return write!(f, "Capability({} | {:#x})", names.join(" | "), unknown);
        }
        write!(f, "Capability({})", names.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_takes_intersection() {
        let local = Capability::current();
        let remote = Capability::NONE.with(Capability::PIPE_FLOW_CONTROL);

        let agreed = local.negotiate(remote);
        assert!(agreed.supports_pipe_flow_control());
        assert!(!agreed.supports_multi_loader_rpc());
        assert_eq!(agreed, remote.negotiate(local));
    }

    #[test]
    fn test_unknown_bits_are_dropped_by_older_peer() {
        let newer = Capability(Capability::current().0 | 0x80);
        let agreed = newer.negotiate(Capability::current());
        assert_eq!(agreed, Capability::current());
    }

    #[test]
    fn test_with_without() {
        let cap = Capability::current().without(Capability::MULTI_LOADER_RPC);
        assert!(!cap.has(Capability::MULTI_LOADER_RPC));
        assert!(cap.with(Capability::MULTI_LOADER_RPC).has(Capability::MULTI_LOADER_RPC));
        assert!(Capability::NONE.has(Capability::NONE));
    }

    #[test]
    fn test_debug_lists_features() {
        assert_eq!(
            format!("{:?}", Capability::current()),
            "Capability(MULTI_LOADER_RPC | PIPE_FLOW_CONTROL)"
        );
    }
}
