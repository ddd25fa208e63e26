//! Transport Layer
//!
//! A [`ChannelService`] is a transport backend that discovers peers and
//! produces authenticated [`Channel`]s. The LAN backend ([`LanService`]) uses
//! UDP identity datagrams for discovery and TCP + TLS for channels.
//!
//! Whether an unknown peer gets a channel at all is decided by the
//! [`AcceptancePolicy`], shared between the services and the manager.

pub mod channel;
pub mod lan;
pub mod tls;
pub mod tls_config;

pub use channel::{lan_address, Channel, ChannelConfig, ChannelState, PendingChannel, LAN_SCHEME};
pub use lan::{LanConfig, LanService};
pub use tls::{LocalIdentity, PeerCertificate};
pub use tls_config::TlsConfig;

use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Default port for both UDP discovery and TCP connections
pub const DEFAULT_PORT: u16 = 1716;

/// A transport backend producing channels
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// URI scheme of the addresses this service handles, e.g. "lan"
    fn name(&self) -> &str;

    /// Bind listeners and start producing channels into `sink`
    ///
    /// Failing to bind the connection listener is an error; losing only
    /// discovery is not.
    async fn start(&self, sink: mpsc::UnboundedSender<Channel>) -> Result<()>;

    /// Stop listening and close every channel this service produced
    async fn stop(&self);

    /// Announce our identity to the network, or to one `host[:port]`
    ///
    /// A host targeted explicitly is remembered as allowed.
    async fn broadcast(&self, address: Option<&str>);

    /// Port actually bound for connections, once started
    fn local_port(&self) -> Option<u16>;
}

/// Outcome of the acceptance precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// A device with this id already exists
    Known,
    /// The peer's host was explicitly targeted
    Allowed,
    /// We are discoverable
    Discoverable,
    /// None of the above: drop silently
    Ignored,
}

impl Acceptance {
    /// True unless ignored
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Acceptance::Ignored)
    }
}

/// Shared state deciding which peers may connect
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct AcceptancePolicy {
    known: Arc<RwLock<HashSet<String>>>,
    discoverable: Arc<AtomicBool>,
}

impl AcceptancePolicy {
    /// New policy with no known devices
    pub fn new(discoverable: bool) -> Self {
        Self {
            known: Arc::default(),
            discoverable: Arc::new(AtomicBool::new(discoverable)),
        }
    }

    /// Apply the precedence: known, then allowed, then discoverable
    pub async fn decide(&self, device_id: &str, allowed: bool) -> Acceptance {
        if self.known.read().await.contains(device_id) {
            Acceptance::Known
        } else if allowed {
            Acceptance::Allowed
        } else if self.is_discoverable() {
            Acceptance::Discoverable
        } else {
            Acceptance::Ignored
        }
    }

    /// Whether unknown, untargeted peers are accepted
    pub fn is_discoverable(&self) -> bool {
        self.discoverable.load(Ordering::SeqCst)
    }

    /// Change discoverability; returns the previous value
    pub fn set_discoverable(&self, discoverable: bool) -> bool {
        self.discoverable.swap(discoverable, Ordering::SeqCst)
    }

    /// Record a device id as known
    pub async fn add_known(&self, device_id: &str) {
        self.known.write().await.insert(device_id.to_string());
    }

    /// Forget a device id
    pub async fn remove_known(&self, device_id: &str) {
        self.known.write().await.remove(device_id);
    }
}
