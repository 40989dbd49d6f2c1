//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Fleet driver core: dispatch, reassembly and command tracking."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flock_msg::{Packet, Source};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DriverError, Result};

/// Outbound side of the communication channel.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Hand a packet to the link layer for delivery to `destination`.
    async fn send(&self, packet: Packet, destination: &Source) -> Result<()>;

    /// Human-readable sink name for logging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Packet accepted by an [`InMemoryPacketSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentPacket {
    pub destination: Source,
    pub packet: Packet,
}

/// Sink that records every packet, primarily for tests and replay.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPacketSink {
    sent: Arc<Mutex<Vec<SentPacket>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryPacketSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    /// Command lines sent so far, decoded from request packets.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|p| match &p.packet {
                Packet::CommandRequest(request) => {
                    Some(String::from_utf8_lossy(&request.body).into_owned())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PacketSink for InMemoryPacketSink {
    async fn send(&self, packet: Packet, destination: &Source) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DriverError::Transport(format!(
                "link to {destination} is down"
            )));
        }
        debug!(destination = %destination, kind = %packet.kind(), "packet queued");
        self.sent.lock().push(SentPacket {
            destination: destination.clone(),
            packet,
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
