//! Host session: paid sector downloads over one connection
//!
//! A `HostSession` owns one connection to a host, the contract it pays from,
//! and a sector-sized receive buffer reused across calls. Every retrieval is
//! one full exchange: price check, download request, revision negotiation,
//! payment recorded, data received.
//!
//! # Reconnecting
//!
//! Hosts drop idle connections. If the connection turns out to be gone
//! before the payment is recorded, the session re-handshakes and repeats the
//! exchange exactly once. Once the host has countersigned, a lost
//! connection is an `IncompleteTransfer`: the money is spent and a retry
//! would pay twice.

use super::contract::{ContractEditor, SignedRevision};
use super::protocol::{
    DownloadAction, Handshake, HandshakeResponse, HostSettings, RenterMessage, RevisionProposal,
    RevisionResponse, RpcKind,
};
use super::transport::{NegotiationWindow, Transport};
use crate::config::Config;
use crate::crypto::sector_merkle_root;
use crate::error::{RenterError, Result};
use crate::metadb::{HostKey, SectorRoot};
use crate::SECTOR_SIZE;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where to reach a host and which key it signs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub key: HostKey,
    pub address: String,
}

/// Timeouts and limits for host connections.
#[derive(Debug, Clone)]
pub struct HostSessionConfig {
    /// TCP connect plus handshake
    pub dial_timeout: Duration,
    /// One retrieval exchange, from settings to last payload byte
    pub negotiation_timeout: Duration,
    /// Deadline kept while the session sits unused
    pub idle_timeout: Duration,
    /// Largest message frame accepted from the host
    pub max_message_len: usize,
}

impl Default for HostSessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HostSessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            dial_timeout: Duration::from_secs(config.host.dial_timeout_secs),
            negotiation_timeout: Duration::from_secs(config.host.negotiation_timeout_secs),
            idle_timeout: Duration::from_secs(config.host.idle_timeout_secs),
            max_message_len: config.host.max_message_bytes,
        }
    }
}

/// A download session with one host.
pub struct HostSession<C> {
    host: HostInfo,
    contract: C,
    config: HostSessionConfig,
    transport: Option<Transport>,
    buffer: Vec<u8>,
    /// The host ended its loop after the last exchange
    stopped: bool,
    closed: bool,
    reconnects: u64,
}

impl<C: ContractEditor> HostSession<C> {
    /// Connect and handshake.
    pub async fn open(host: HostInfo, contract: C, config: HostSessionConfig) -> Result<Self> {
        let transport = handshake(&host, &contract, &config).await?;
        info!(host = %host.key, address = %host.address, "Host session established");

        Ok(Self {
            host,
            contract,
            config,
            transport: Some(transport),
            buffer: vec![0u8; SECTOR_SIZE],
            stopped: false,
            closed: false,
            reconnects: 0,
        })
    }

    pub fn host_key(&self) -> HostKey {
        self.host.key
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn contract(&self) -> &C {
        &self.contract
    }

    /// Whether a connection is currently held.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Handshakes performed after `open`.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Download `len` bytes at `offset` of the sector with `root`.
    ///
    /// The returned slice borrows the session buffer and is overwritten by
    /// the next call.
    pub async fn retrieve_range(
        &mut self,
        root: &SectorRoot,
        offset: u64,
        len: u64,
    ) -> Result<&[u8]> {
        check_range(offset, len)?;
        if self.closed {
            return Err(RenterError::Connection(format!(
                "session with {} is closed",
                self.host.key
            )));
        }
        if self.transport.is_none() || self.stopped {
            self.reconnect().await?;
        }

        let received = match self.exchange(root, offset, len).await {
            Ok(received) => received,
            Err(err) if err.is_retryable_disconnect() => {
                warn!(host = %self.host.key, error = %err, "Host dropped connection, reconnecting");
                self.reconnect().await?;
                match self.exchange(root, offset, len).await {
                    Ok(received) => received,
                    Err(err) => return Err(self.fail(err)),
                }
            }
            Err(err) => return Err(self.fail(err)),
        };

        debug!(host = %self.host.key, root = %root, offset, len, "Retrieved sector range");
        Ok(&self.buffer[..received])
    }

    /// Download a whole sector and check it against its Merkle root.
    pub async fn retrieve_full_sector(&mut self, root: &SectorRoot) -> Result<&[u8]> {
        let received = self
            .retrieve_range(root, 0, SECTOR_SIZE as u64)
            .await?
            .len();

        let computed = sector_merkle_root(&self.buffer[..received]);
        if computed != *root {
            self.transport = None;
            return Err(RenterError::IntegrityViolation(format!(
                "host {} sent sector with root {}, expected {}",
                self.host.key, computed, root
            )));
        }
        Ok(&self.buffer[..received])
    }

    /// Say goodbye and drop the connection. Idempotent.
    pub async fn close(&mut self) {
        self.closed = true;
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if !self.stopped {
            transport.set_deadline(self.config.negotiation_timeout);
            if let Err(e) = transport.send(&RenterMessage::Goodbye).await {
                debug!(host = %self.host.key, error = %e, "Goodbye not delivered");
            }
        }
        transport.shutdown().await;
        info!(host = %self.host.key, "Host session closed");
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.transport = None;
        let transport = handshake(&self.host, &self.contract, &self.config).await?;
        self.transport = Some(transport);
        self.stopped = false;
        self.reconnects += 1;
        debug!(host = %self.host.key, reconnects = self.reconnects, "Reconnected to host");
        Ok(())
    }

    /// Drop the connection unless the failure left it in a known state.
    fn fail(&mut self, err: RenterError) -> RenterError {
        match err {
            RenterError::InsufficientFunds { .. } => err,
            RenterError::HostDisconnected(reason) => {
                self.transport = None;
                RenterError::Connection(reason)
            }
            err => {
                self.transport = None;
                err
            }
        }
    }

    /// One retrieval exchange on the current connection.
    async fn exchange(&mut self, root: &SectorRoot, offset: u64, len: u64) -> Result<usize> {
        let Self {
            host,
            contract,
            config,
            transport,
            buffer,
            stopped,
            ..
        } = self;
        let transport = transport.as_mut().ok_or_else(|| {
            RenterError::HostDisconnected(format!("no connection to {}", host.key))
        })?;
        let mut conn =
            NegotiationWindow::open(transport, config.negotiation_timeout, config.idle_timeout);

        // Step 1: Check the price against remaining funds
        conn.send(&RenterMessage::Settings).await?;
        let settings: HostSettings = conn.recv(config.max_message_len).await?;
        let price = settings
            .download_price
            .checked_mul(len)
            .ok_or_else(|| RenterError::Negotiation("download price overflows".into()))?;
        let current = &contract.revision().revision;
        if current.renter_payout < price {
            return Err(RenterError::InsufficientFunds {
                available: current.renter_payout.0,
                required: price.0,
            });
        }

        // Step 2: Request the data
        conn.send(&RenterMessage::Download(DownloadAction {
            root: *root,
            offset,
            len,
        }))
        .await?;

        // Step 3: Pay for it
        let revision = current.download_revision(price)?;
        let renter_signature = revision.sign(contract.renter_key());
        conn.send(&RenterMessage::Revision(RevisionProposal {
            revision: revision.clone(),
            renter_signature,
        }))
        .await?;
        let negotiated = conn
            .recv::<RevisionResponse>(config.max_message_len)
            .await?
            .into_negotiated()?;
        host.key.verify(&revision.sig_hash(), negotiated.host_signature())?;

        // Step 4: Record the payment before anything else
        contract.sync_with_host(SignedRevision {
            revision,
            renter_signature,
            host_signature: *negotiated.host_signature(),
        })?;
        *stopped = negotiated.is_stop();

        // Step 5: Receive; the payment is spent, so transport failures are final
        let received = conn.recv_sector(buffer).await.map_err(|err| match err {
            RenterError::HostDisconnected(reason) | RenterError::Connection(reason) => {
                RenterError::IncompleteTransfer(format!(
                    "connection lost after payment: {}",
                    reason
                ))
            }
            other => other,
        })?;
        if received as u64 != len {
            return Err(RenterError::IncompleteTransfer(format!(
                "host sent {} bytes, expected {}",
                received, len
            )));
        }
        Ok(received)
    }
}

async fn handshake<C: ContractEditor>(
    host: &HostInfo,
    contract: &C,
    config: &HostSessionConfig,
) -> Result<Transport> {
    let mut transport =
        Transport::connect(&host.address, config.dial_timeout, config.idle_timeout).await?;

    {
        let mut conn =
            NegotiationWindow::open(&mut transport, config.dial_timeout, config.idle_timeout);
        conn.send(&Handshake {
            rpc: RpcKind::Download,
            revision: contract.revision().clone(),
        })
        .await
        .map_err(surface_disconnect)?;

        let response: HandshakeResponse = conn
            .recv(config.max_message_len)
            .await
            .map_err(surface_disconnect)?;
        if let HandshakeResponse::Rejected(reason) = response {
            return Err(RenterError::Negotiation(format!(
                "host {} rejected handshake: {}",
                host.key, reason
            )));
        }
    }

    Ok(transport)
}

fn surface_disconnect(err: RenterError) -> RenterError {
    match err {
        RenterError::HostDisconnected(reason) => RenterError::Connection(reason),
        other => other,
    }
}

fn check_range(offset: u64, len: u64) -> Result<()> {
    let limit = SECTOR_SIZE as u64;
    let end = offset.checked_add(len);
    if len == 0 || end.map_or(true, |end| end > limit) {
        return Err(RenterError::InvalidRange {
            offset,
            length: len,
            limit,
        });
    }
    Ok(())
}
