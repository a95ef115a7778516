//! Scripted host for tests
//!
//! Speaks the host side of the protocol on a localhost port. Faults queued
//! with `inject` apply to successive revision exchanges, one per exchange.

use super::contract::{ContractId, ContractRevision, Currency, MemoryContract, SignedRevision};
use super::protocol::{
    self, Handshake, HandshakeResponse, HostSettings, RenterMessage, RevisionResponse,
    SectorHeader, FRAME_HEADER_LEN,
};
use super::session::HostInfo;
use crate::crypto::sector_merkle_root;
use crate::error::{RenterError, Result};
use crate::metadb::{HostKey, SectorRoot};
use crate::SECTOR_SIZE;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Misbehaviour applied to one revision exchange.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Close the connection instead of answering the revision
    DropBeforeResponse,
    /// Countersign, then close without sending data
    DropAfterResponse,
    /// Sit on the revision without answering
    Stall,
    Reject(String),
    /// Countersign with `Stop` and end the loop after the data
    Stop,
    /// Flip a bit in the payload
    TamperPayload,
    /// Send one byte less than requested
    ShortPayload,
    /// Claim two sectors in the frame header
    BadHeader,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockLog {
    pub handshakes: usize,
    pub download_requests: usize,
    pub payments: Vec<ContractRevision>,
    pub goodbyes: usize,
}

#[derive(Default)]
struct State {
    sectors: HashMap<SectorRoot, Vec<u8>>,
    faults: VecDeque<Fault>,
    handshake_rejections: usize,
    /// Latest paid revision per contract
    revisions: HashMap<ContractId, u64>,
    log: MockLog,
}

pub(crate) struct MockHost {
    key: SigningKey,
    address: String,
    state: Arc<Mutex<State>>,
    accept_task: JoinHandle<()>,
}

impl MockHost {
    /// Listen on an ephemeral port, charging `price` per byte.
    pub async fn spawn(price: Currency) -> MockHost {
        let key = SigningKey::generate(&mut OsRng);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_task = {
            let key = key.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let key = key.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, key, price, state).await;
                    });
                }
            })
        };

        MockHost {
            key,
            address,
            state,
            accept_task,
        }
    }

    pub fn key(&self) -> HostKey {
        HostKey::from(self.key.verifying_key())
    }

    pub fn info(&self) -> HostInfo {
        HostInfo {
            key: self.key(),
            address: self.address.clone(),
        }
    }

    /// Store a sector (zero padded) under its real root.
    pub fn store_sector(&self, mut data: Vec<u8>) -> SectorRoot {
        data.resize(SECTOR_SIZE, 0);
        let root = sector_merkle_root(&data);
        self.store_sector_as(root, data);
        root
    }

    /// Store a sector under whatever root the test claims.
    pub fn store_sector_as(&self, root: SectorRoot, mut data: Vec<u8>) {
        data.resize(SECTOR_SIZE, 0);
        self.state().sectors.insert(root, data);
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    pub fn reject_next_handshake(&self) {
        self.state().handshake_rejections += 1;
    }

    pub fn log(&self) -> MockLog {
        self.state().log.clone()
    }

    /// A fresh contract with this host, signed by both sides.
    pub fn form_contract(&self, funds: Currency) -> MemoryContract {
        let renter = SigningKey::generate(&mut OsRng);
        let revision = ContractRevision {
            contract_id: ContractId(rand::random()),
            revision_number: 1,
            renter_payout: funds,
            host_payout: Currency::ZERO,
            file_size: 0,
            file_merkle_root: SectorRoot([0; 32]),
            window_end: 1_000,
        };
        let signed = SignedRevision {
            renter_signature: revision.sign(&renter),
            host_signature: revision.sign(&self.key),
            revision,
        };
        MemoryContract::new(signed, renter)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    key: SigningKey,
    price: Currency,
    state: Arc<Mutex<State>>,
) -> Result<()> {
    let handshake: Handshake = read_message(&mut stream).await?;
    let rejection = {
        let mut state = state.lock().unwrap();
        state.log.handshakes += 1;
        let contract = handshake.revision.revision.contract_id;
        let paid = state.revisions.get(&contract).copied().unwrap_or(0);
        if state.handshake_rejections > 0 {
            state.handshake_rejections -= 1;
            Some("maintenance".to_string())
        } else if handshake.revision.revision.revision_number < paid {
            Some("stale revision".to_string())
        } else {
            None
        }
    };
    match rejection {
        Some(reason) => {
            write_message(&mut stream, &HandshakeResponse::Rejected(reason)).await?;
            return Ok(());
        }
        None => write_message(&mut stream, &HandshakeResponse::Accepted).await?,
    }

    let mut revision = handshake.revision.revision;
    let mut pending = None;
    loop {
        match read_message::<RenterMessage>(&mut stream).await? {
            RenterMessage::Settings => {
                write_message(&mut stream, &HostSettings { download_price: price }).await?;
            }
            RenterMessage::Download(action) => {
                state.lock().unwrap().log.download_requests += 1;
                pending = Some(action);
            }
            RenterMessage::Revision(proposal) => {
                let (fault, sector) = {
                    let mut state = state.lock().unwrap();
                    let fault = state.faults.pop_front();
                    let sector = pending
                        .as_ref()
                        .and_then(|action| state.sectors.get(&action.root).cloned());
                    (fault, sector)
                };
                let Some(action) = pending.take() else {
                    reject(&mut stream, "no download requested").await?;
                    continue;
                };
                let Some(sector) = sector else {
                    reject(&mut stream, "unknown sector").await?;
                    continue;
                };

                match &fault {
                    Some(Fault::DropBeforeResponse) => return Ok(()),
                    Some(Fault::Stall) => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        return Ok(());
                    }
                    Some(Fault::Reject(reason)) => {
                        reject(&mut stream, reason).await?;
                        continue;
                    }
                    _ => {}
                }

                let expected = price
                    .checked_mul(action.len)
                    .and_then(|cost| revision.download_revision(cost).ok());
                if expected.as_ref() != Some(&proposal.revision) {
                    reject(&mut stream, "unexpected revision").await?;
                    continue;
                }

                let signature = proposal.revision.sign(&key);
                revision = proposal.revision.clone();
                {
                    let mut state = state.lock().unwrap();
                    state
                        .revisions
                        .insert(revision.contract_id, revision.revision_number);
                    state.log.payments.push(revision.clone());
                }

                let stop = matches!(fault, Some(Fault::Stop));
                let response = if stop {
                    RevisionResponse::Stop(signature)
                } else {
                    RevisionResponse::Accept(signature)
                };
                write_message(&mut stream, &response).await?;
                if matches!(fault, Some(Fault::DropAfterResponse)) {
                    return Ok(());
                }

                let start = action.offset as usize;
                let mut payload = sector[start..start + action.len as usize].to_vec();
                let mut header = SectorHeader::for_payload(payload.len());
                match fault {
                    Some(Fault::TamperPayload) => payload[0] ^= 0x01,
                    Some(Fault::ShortPayload) => {
                        payload.pop();
                        header = SectorHeader::for_payload(payload.len());
                    }
                    Some(Fault::BadHeader) => header.count = 2,
                    _ => {}
                }
                stream.write_all(&header.to_bytes()).await?;
                stream.write_all(&payload).await?;

                if stop {
                    return Ok(());
                }
            }
            RenterMessage::Goodbye => {
                state.lock().unwrap().log.goodbyes += 1;
                return Ok(());
            }
        }
    }
}

async fn reject(stream: &mut TcpStream, reason: &str) -> Result<()> {
    write_message(stream, &RevisionResponse::Reject(reason.to_string())).await
}

async fn read_message<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = protocol::frame_len(header, 1024 * 1024)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    protocol::decode_body(&body)
}

async fn write_message<T: Serialize>(stream: &mut TcpStream, message: &T) -> Result<()> {
    let frame = protocol::encode_frame(message)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| RenterError::Connection(e.to_string()))
}
