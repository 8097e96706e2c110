//! Stateful ticket signing: usage counters, the epoch cache and the server
//! identity of the current session.
//!
//! The signer does not talk to the network itself. The connection manager
//! feeds it the block timestamp when the cached epoch has expired and sends the
//! tickets it builds.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use protocol::{epoch_expiry, epoch_for_timestamp, Address, ClientIdentity, SignedTicket, Ticket};

/// Source of the current unix time in seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns a clock backed by the system time.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    })
}

/// Ticket fields that are fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketParams {
    pub chain_id: u64,
    pub fleet_contract: Address,
}

/// An epoch and the local time it stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochCache {
    pub epoch: u64,
    pub expires_at: u64,
}

impl EpochCache {
    fn is_valid(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Builds and signs usage tickets.
pub struct TicketSigner {
    identity: ClientIdentity,
    params: TicketParams,
    server_id: Mutex<Option<Address>>,
    total_connections: AtomicU64,
    total_bytes: AtomicU64,
    epoch_cache: Mutex<Option<EpochCache>>,
    clock: Clock,
    renewal: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TicketSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketSigner")
            .field("client", &self.identity.address())
            .field("params", &self.params)
            .field("total_connections", &self.total_connections())
            .field("total_bytes", &self.total_bytes())
            .finish_non_exhaustive()
    }
}

impl TicketSigner {
    /// Creates a signer using the system clock.
    pub fn new(identity: ClientIdentity, params: TicketParams) -> Self {
        Self::with_clock(identity, params, system_clock())
    }

    /// Creates a signer with an explicit clock.
    pub fn with_clock(identity: ClientIdentity, params: TicketParams, clock: Clock) -> Self {
        Self {
            identity,
            params,
            server_id: Mutex::new(None),
            total_connections: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            epoch_cache: Mutex::new(None),
            clock,
            renewal: tokio::sync::Mutex::new(()),
        }
    }

    /// Address of the client identity.
    pub fn client_address(&self) -> Address {
        self.identity.address()
    }

    /// Records the identity of the server of a new session.
    pub fn set_server(&self, server_id: Address) {
        *self.server_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(server_id);
    }

    /// Identity of the current server, once a session has been established.
    pub fn server_id(&self) -> Option<Address> {
        *self.server_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds to the cumulative byte counter.
    pub fn add_bytes(&self, n: u64) -> u64 {
        self.total_bytes.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Cumulative bytes handed to channel sends.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Number of tickets built so far.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::SeqCst)
    }

    /// Current time according to the signer's clock.
    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Returns the cached epoch if it has not expired.
    pub fn cached_epoch(&self) -> Option<u64> {
        let now = self.now();
        self.epoch_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .filter(|cache| cache.is_valid(now))
            .map(|cache| cache.epoch)
    }

    /// Returns the current epoch, calling `fetch_timestamp` for the latest
    /// block timestamp only when the cache has expired.
    pub async fn epoch_with<F, Fut>(&self, fetch_timestamp: F) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if let Some(epoch) = self.cached_epoch() {
            tracing::trace!(epoch, "using cached epoch");
            return Ok(epoch);
        }

        let timestamp = fetch_timestamp().await?;
        let now = self.now();
        let cache = EpochCache {
            epoch: epoch_for_timestamp(timestamp),
            expires_at: epoch_expiry(timestamp, now),
        };
        tracing::debug!(
            epoch = cache.epoch,
            expires_at = cache.expires_at,
            block_timestamp = timestamp,
            "fetched new epoch"
        );
        *self.epoch_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(cache);
        Ok(cache.epoch)
    }

    /// Builds and signs the next ticket for `epoch`.
    ///
    /// Each call counts as one connection.
    pub fn build_ticket(&self, epoch: u64) -> Result<SignedTicket> {
        let server_id = self.server_id().ok_or_else(|| {
            ProtocolError::InvalidPublicKey("server identity not yet known".to_string())
        })?;
        let total_connections = self.total_connections.fetch_add(1, Ordering::SeqCst) + 1;

        let ticket = Ticket {
            chain_id: self.params.chain_id,
            epoch,
            fleet_contract: self.params.fleet_contract,
            server_id,
            total_connections,
            total_bytes: self.total_bytes(),
            local_address: Bytes::new(),
        };
        tracing::trace!(
            epoch,
            total_connections,
            total_bytes = ticket.total_bytes,
            "signing ticket"
        );
        ticket.sign(&self.identity)
    }

    /// Serializes ticket renewals.
    ///
    /// Hold the guard from building a ticket until the server has accepted it.
    pub async fn renewal_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.renewal.lock().await
    }
}
