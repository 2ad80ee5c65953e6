//! UDP transport and task orchestration.
//!
//! One socket per configured listen address, one receive loop per socket,
//! one tokio task per datagram. The transport never interprets payload
//! bytes; it hands `(bytes, source, interface)` to the protocol handler
//! and transmits whatever comes back. `stop()` flips a watch channel that
//! every loop selects on, so shutdown latency is bounded by the longest
//! configured interval.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, parse_listen_address};
use crate::engine::LeaseEngine;
use crate::error::{Error, Result};
use crate::handler::{ProtocolHandler, StatsSnapshot};
use crate::security::SecurityValidator;

const DHCP_SERVER_PORT: u16 = 67;
const RECV_BUFFER_SIZE: usize = 1500;
const TRACKER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

struct Binding {
    socket: Arc<UdpSocket>,
    server_ip: Ipv4Addr,
    iface: String,
}

pub struct DhcpServer {
    config: Arc<Config>,
    engine: Arc<LeaseEngine>,
    security: Arc<SecurityValidator>,
    handler: Arc<ProtocolHandler>,
    bindings: Vec<Binding>,
    shutdown: watch::Sender<bool>,
}

impl DhcpServer {
    /// Builds the server: recovers leases, binds every listen address.
    /// Any bind failure is fatal.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let engine = Arc::new(LeaseEngine::new(Arc::clone(&config)).await?);
        let security = Arc::new(SecurityValidator::new(&config.security));
        let handler = Arc::new(ProtocolHandler::new(
            Arc::clone(&config),
            Arc::clone(&engine),
            Arc::clone(&security),
        ));

        let mut bindings = Vec::new();
        for entry in &config.server.listen_addresses {
            let (server_ip, iface) = parse_listen_address(entry)?;
            let socket = bind_socket(SocketAddrV4::new(server_ip, DHCP_SERVER_PORT))?;
            info!("Listening on {}:{} ({})", server_ip, DHCP_SERVER_PORT, iface);
            bindings.push(Binding {
                socket: Arc::new(socket),
                server_ip,
                iface,
            });
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            engine,
            security,
            handler,
            bindings,
            shutdown,
        })
    }

    /// Serves until [`DhcpServer::stop`] is called, then joins every task
    /// and flushes the lease file.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Vec::new();

        for binding in &self.bindings {
            tasks.push(tokio::spawn(receive_loop(
                Arc::clone(&binding.socket),
                binding.server_ip,
                binding.iface.clone(),
                Arc::clone(&self.handler),
                self.shutdown.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(
            Arc::clone(&self.engine).run_reaper(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.engine).run_autosave(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(tracker_cleanup_loop(
            Arc::clone(&self.security),
            self.shutdown.subscribe(),
        )));

        info!(
            "Serving {} subnets on {} sockets",
            self.config.subnets.len(),
            self.bindings.len()
        );

        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for task in tasks {
            if let Err(error) = task.await {
                warn!("Worker task failed: {}", error);
            }
        }

        self.engine.save().await?;
        info!("Shutdown complete, lease file flushed");
        Ok(())
    }

    /// Signals every loop to exit at its next wake.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handler.stats()
    }

    pub async fn active_lease_count(&self) -> usize {
        self.engine.active_lease_count().await
    }

    pub fn engine(&self) -> &Arc<LeaseEngine> {
        &self.engine
    }

    pub fn security(&self) -> &Arc<SecurityValidator> {
        &self.security
    }

    pub async fn save_leases(&self) -> Result<()> {
        self.engine.save().await
    }
}

fn bind_socket(bind_addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("failed to set non-blocking: {}", error)))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("failed to bind {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("failed to register socket: {}", error)))
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    server_ip: Ipv4Addr,
    iface: String,
    handler: Arc<ProtocolHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                match received {
                    Ok((size, source)) => {
                        let data = buffer[..size].to_vec();
                        let socket = Arc::clone(&socket);
                        let handler = Arc::clone(&handler);
                        let iface = iface.clone();

                        tokio::spawn(async move {
                            if let Some(outbound) =
                                handler.handle(&data, source, &iface, server_ip).await
                                && let Err(error) =
                                    socket.send_to(&outbound.payload, outbound.destination).await
                            {
                                warn!("Failed to send reply to {}: {}", outbound.destination, error);
                            }
                        });
                    }
                    Err(error) => {
                        // A transient receive error must not kill the socket.
                        error!("Receive error on {}: {}", iface, error);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Receive loop on {} exiting", iface);
                    break;
                }
            }
        }
    }
}

async fn tracker_cleanup_loop(
    security: Arc<SecurityValidator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TRACKER_CLEANUP_INTERVAL) => {
                security.cleanup_trackers();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(RECV_BUFFER_SIZE, 1500);
    }

    #[tokio::test]
    async fn test_bind_socket_on_ephemeral_port() {
        let socket = bind_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.port() != 0);
        assert!(socket.broadcast().unwrap());
    }

    #[tokio::test]
    async fn test_two_sockets_can_share_an_address() {
        let first = bind_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = match first.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr.port(),
            _ => unreachable!(),
        };
        // SO_REUSEADDR lets a restarting server rebind immediately.
        drop(first);
        let second = bind_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        assert!(second.is_ok());
    }
}
