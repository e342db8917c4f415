//! Rootless port-forwarding helper.
//!
//! Launched by the engine as a detached child. The configuration
//! arrives as a single JSON document on standard input; descriptors 3
//! and 4 carry the exit-notification and readiness pipes. Once every
//! host socket is bound, a marker byte on the readiness pipe unblocks
//! the engine, and the process serves until the exit pipe reaches EOF.
//!
//! Standard output is reserved for a one-line human-readable startup
//! error (the engine prefers it over its own verbose diagnostics);
//! debug logging goes to standard error.

#![allow(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use burrow_usernet::portfwd::ForwarderConfig;
use burrow_usernet::types::Protocol;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Forward host ports into a rootless container network.
#[derive(Parser, Debug)]
#[command(name = "burrow-portfwd", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(EnvFilter::from_default_env().add_directive("burrow_portfwd=debug".parse()?))
        .init();
    let _cli = Cli::parse();

    match run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // One line on stdout for the supervising engine to surface.
            println!("{err:#}");
            Err(err)
        }
    }
}

async fn run() -> Result<()> {
    let config: ForwarderConfig = serde_json::from_reader(std::io::stdin().lock())
        .wrap_err("read configuration from stdin")?;
    tracing::debug!(
        netns = %config.netns_path.display(),
        tmp_dir = %config.tmp_dir.display(),
        child_ip = %config.child_ip,
        mappings = config.mappings.len(),
        "configuration loaded"
    );

    // Bind everything before signaling readiness, so a port conflict
    // reaches the engine instead of racing the container start.
    let mut tcp = Vec::new();
    let mut udp = Vec::new();
    for mapping in &config.mappings {
        let host = SocketAddr::new(
            mapping
                .host_ip
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            mapping.host_port,
        );
        let target = SocketAddr::new(IpAddr::V4(config.child_ip), mapping.container_port);
        match mapping.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(host)
                    .await
                    .map_err(|e| eyre!("cannot listen on {host}/tcp: {e}"))?;
                tcp.push((listener, target));
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(host)
                    .await
                    .map_err(|e| eyre!("cannot listen on {host}/udp: {e}"))?;
                udp.push((socket, target));
            }
        }
    }

    signal_ready(config.ready_fd)?;

    for (listener, target) in tcp {
        let _ = tokio::spawn(serve_tcp(listener, target));
    }
    for (socket, target) in udp {
        let _ = tokio::spawn(serve_udp(socket, target));
    }

    await_exit(config.exit_fd).await;
    tracing::debug!("exit notification received, shutting down");
    Ok(())
}

/// Write the readiness marker and close the pipe.
fn signal_ready(fd: i32) -> Result<()> {
    // SAFETY: the engine transferred this descriptor at a fixed number
    // and nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let _ = rustix::io::write(&fd, b"1").wrap_err("write readiness marker")?;
    Ok(())
}

/// Block until the engine closes its end of the exit pipe.
async fn await_exit(fd: i32) {
    let _ = tokio::task::spawn_blocking(move || {
        // SAFETY: fixed descriptor transferred by the engine.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut buf = [0u8; 1];
        loop {
            match rustix::io::read(&fd, &mut buf[..]) {
                Ok(0) => break,
                Ok(_) => {}
                Err(rustix::io::Errno::INTR) => {}
                Err(_) => break,
            }
        }
    })
    .await;
}

/// Accept loop for one TCP mapping.
async fn serve_tcp(listener: TcpListener, target: SocketAddr) {
    loop {
        match listener.accept().await {
            Ok((mut inbound, peer)) => {
                let _ = tokio::spawn(async move {
                    match TcpStream::connect(target).await {
                        Ok(mut outbound) => {
                            if let Err(err) = copy_bidirectional(&mut inbound, &mut outbound).await
                            {
                                tracing::debug!(%peer, error = %err, "tcp proxy ended");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%target, error = %err, "cannot reach container port");
                        }
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Datagram relay for one UDP mapping. Replies go to the most recent
/// host-side peer.
async fn serve_udp(socket: UdpSocket, target: SocketAddr) {
    let upstream = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::warn!(error = %err, "cannot create upstream udp socket");
            return;
        }
    };
    if let Err(err) = upstream.connect(target).await {
        tracing::warn!(%target, error = %err, "cannot reach container port");
        return;
    }

    let mut inbound_buf = vec![0u8; 65536];
    let mut reply_buf = vec![0u8; 65536];
    let mut last_peer: Option<SocketAddr> = None;
    loop {
        tokio::select! {
            received = socket.recv_from(&mut inbound_buf) => match received {
                Ok((len, peer)) => {
                    last_peer = Some(peer);
                    if let Err(err) = upstream.send(&inbound_buf[..len]).await {
                        tracing::debug!(error = %err, "udp forward failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "udp receive failed");
                    break;
                }
            },
            received = upstream.recv(&mut reply_buf) => match received {
                Ok(len) => {
                    if let Some(peer) = last_peer {
                        let _ = socket.send_to(&reply_buf[..len], peer).await;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "udp reply receive failed");
                }
            },
        }
    }
}
