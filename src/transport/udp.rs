//! UDP transport
//!
//! Binds a local port, resolves the remote host once, and moves datagrams
//! in both directions. Sending uses the non-blocking path so the pacer sees
//! backpressure as [`SendOutcome::Pending`] instead of stalling the session
//! task; the one pending packet is flushed when the socket signals
//! writable. Receiving runs on its own task and forwards
//! `(source_address, bytes)` pairs over a channel.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::pacing::{PacketSink, SendOutcome, MULTICAST_ADDR};
use crate::transport::{PacketTransport, ReceivedPacket};
use crate::{Packet, PacketRef, Result};

/// Receive buffer size; comfortably above the path MTU
const MAX_RECEIVE_PACKET_SIZE: usize = 4096;

/// Configuration of one UDP transport
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Local address to bind; port 0 picks one
    pub local_addr: SocketAddr,

    /// Remote host to resolve once at startup; empty for receive-only use
    pub remote_host: String,

    /// Remote port
    pub remote_port: u16,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            remote_host: String::new(),
            remote_port: 0,
        }
    }
}

/// Datagram I/O for one session
pub struct UdpTransport {
    socket: Arc<UdpSocket>,

    remote_addr: Option<SocketAddr>,

    /// Addresses learned from inbound packets, keyed by their string form
    addr_from_str: Arc<Mutex<HashMap<String, SocketAddr>>>,

    /// The single packet waiting for the socket to become writable
    pending_packet: Option<(SocketAddr, PacketRef)>,

    bytes_sent: i64,

    receive_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind the local socket and resolve the remote host
    pub async fn new(config: UdpTransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.local_addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind UDP socket: {}", e)))?;

        let remote_addr = if config.remote_host.is_empty() {
            None
        } else {
            let target = format!("{}:{}", config.remote_host, config.remote_port);
            let addr = lookup_host(&target)
                .await
                .map_err(|e| Error::Transport(format!("Failed to resolve {}: {}", target, e)))?
                .next()
                .ok_or_else(|| {
                    Error::Transport(format!("No address found for {}", target))
                })?;
            info!("Resolved {} to {}", target, addr);
            Some(addr)
        };

        let transport = Self {
            socket: Arc::new(socket),
            remote_addr,
            addr_from_str: Arc::new(Mutex::new(HashMap::new())),
            pending_packet: None,
            bytes_sent: 0,
            receive_task: None,
        };
        transport.join_multicast_group()?;
        Ok(transport)
    }

    /// The bound local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local address: {}", e)))
    }

    /// Start the receive loop; packets arrive on the returned channel
    pub fn start_receiving(&mut self) -> mpsc::UnboundedReceiver<ReceivedPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = self.socket.clone();
        let addr_from_str = self.addr_from_str.clone();

        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_RECEIVE_PACKET_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((size, source)) => {
                        let addr = source.to_string();
                        addr_from_str
                            .lock()
                            .unwrap()
                            .entry(addr.clone())
                            .or_insert(source);
                        let packet: Packet = buffer[..size].to_vec();
                        if tx.send((addr, packet)).is_err() {
                            // Session is gone.
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Problem when receiving packet: {}", e);
                    }
                }
            }
        });
        self.receive_task = Some(task);
        rx
    }

    /// Re-join the multicast group, typically after a network timeout
    pub fn rejoin_multicast_group(&self) {
        if let Err(e) = self.join_multicast_group() {
            warn!("Could not rejoin multicast group: {}", e);
        }
    }

    fn join_multicast_group(&self) -> Result<()> {
        if let Some(SocketAddr::V4(addr)) = self.remote_addr {
            if addr.ip().is_multicast() {
                self.socket
                    .join_multicast_v4(*addr.ip(), Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| {
                        Error::Transport(format!("Failed to join multicast group: {}", e))
                    })?;
                debug!("Joined multicast group {}", addr.ip());
            }
        }
        Ok(())
    }

    fn resolve_logical_addr(&self, addr: &str) -> Option<SocketAddr> {
        if addr == MULTICAST_ADDR {
            self.remote_addr
        } else {
            self.addr_from_str.lock().unwrap().get(addr).copied()
        }
    }

    /// Stop the receive loop
    pub fn close(&mut self) {
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl PacketSink for UdpTransport {
    fn send_packet(&mut self, addr: &str, packet: &PacketRef) -> SendOutcome {
        self.bytes_sent += packet.len() as i64;

        let net_addr = match self.resolve_logical_addr(addr) {
            Some(net_addr) => net_addr,
            None => {
                error!("Can't find address for: {}", addr);
                // Counted and dropped; the stream recovers via NACKs.
                return SendOutcome::Sent;
            }
        };

        debug_assert!(self.pending_packet.is_none(), "send while a packet is pending");

        match self.socket.try_send_to(packet, net_addr) {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pending_packet = Some((net_addr, packet.clone()));
                SendOutcome::Pending
            }
            Err(e) => {
                error!("Failed to send packet: {}", e);
                SendOutcome::Sent
            }
        }
    }

    fn bytes_sent(&self) -> i64 {
        self.bytes_sent
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    fn try_send(&mut self, addr: &str, packet: &PacketRef) -> SendOutcome {
        self.send_packet(addr, packet)
    }

    async fn flush_pending(&mut self) -> Result<()> {
        while let Some((net_addr, packet)) = self.pending_packet.take() {
            self.socket
                .writable()
                .await
                .map_err(|e| Error::Transport(format!("Waiting for writable failed: {}", e)))?;
            match self.socket.try_send_to(&packet, net_addr) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending_packet = Some((net_addr, packet));
                }
                Err(e) => {
                    error!("Failed to send packet: {}", e);
                }
            }
        }
        Ok(())
    }
}
