//! The Tunnel Engine: the single-threaded, single-task readiness loop that
//! shuttles frames between a TAP device and a UDP socket. Owns `K`, the
//! nonces, the peer address, and the size watermarks by value; nothing here
//! is ever shared across tasks or guarded by a lock.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, Role};
use crate::crypto::SharedSecretBox;
use crate::error::TunnelError;
use crate::nonce::{Nonce, NONCE_LEN};
use crate::tap::{TapDevice, TapIo};

const READINESS_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_FRAME_LEN: usize = 64;
const KEEPALIVE_TAG: u8 = 0xFE;
const KEEPALIVE_LEN: usize = 3;
const BUF_LEN: usize = 2048;

/// Peer-binding state. A listener starts `Unset`; a connector starts
/// `Bound`. There is no transition back to `Unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Unset,
    Bound,
}

pub struct TunnelEngine<T: TapIo> {
    secret: SharedSecretBox,
    role: Role,
    tap: T,
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    state: PeerState,
    n_out: Nonce,
    n_in: Nonce,
    biggest_tried: u16,
    biggest_sent: u16,
    biggest_rcvd: u16,
}

impl TunnelEngine<TapDevice> {
    /// Build the engine against a real, administrator-preconfigured TAP
    /// interface. Binds the UDP socket and, for a connector, sends the
    /// initial keepalive.
    pub async fn new(config: &Config, secret: SharedSecretBox, prefix: [u8; 4]) -> anyhow::Result<Self> {
        let tap = TapDevice::attach(&config.tap_name)?;
        Self::with_tap(config, secret, prefix, tap).await
    }
}

impl<T: TapIo> TunnelEngine<T> {
    /// Build the engine against any `TapIo` implementation (production or
    /// test double).
    pub async fn with_tap(config: &Config, secret: SharedSecretBox, prefix: [u8; 4], tap: T) -> anyhow::Result<Self> {
        let socket = bind_udp(config.bind_addr).context("binding UDP socket")?;

        let (peer, state) = match config.role {
            Role::Listener => (None, PeerState::Unset),
            Role::Connector => (Some(config.peer_addr), PeerState::Bound),
        };

        let mut engine = TunnelEngine {
            secret,
            role: config.role,
            tap,
            socket,
            peer,
            state,
            n_out: Nonce::from_prefix(prefix),
            n_in: Nonce::ZERO,
            biggest_tried: 0,
            biggest_sent: 0,
            biggest_rcvd: 0,
        };

        if config.role == Role::Connector {
            engine
                .send_keepalive()
                .await
                .context("sending initial keepalive")?;
            info!(peer = %engine.peer.unwrap(), "connector: registered address with peer");
        }

        Ok(engine)
    }

    /// Run the readiness loop until a fatal error or a graceful shutdown
    /// signal. Never returns `Ok` except via graceful shutdown.
    ///
    /// The idle timeout is a deadline that gets pushed out to "10 seconds
    /// from now" every time the UDP or TAP arm fires, so a keepalive is only
    /// emitted after a genuine 10-second silence on both fds, not on a fixed
    /// wall-clock schedule.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let mut tap_buf = [0u8; BUF_LEN];
        let mut udp_buf = [0u8; BUF_LEN];

        let idle_deadline = sleep(READINESS_TIMEOUT);
        tokio::pin!(idle_deadline);

        loop {
            let tap_enabled = self.peer.is_some();

            tokio::select! {
                biased;

                _ = wait_for_shutdown() => {
                    info!("received shutdown signal, exiting");
                    return Ok(());
                }

                res = self.socket.recv_from(&mut udp_buf) => {
                    idle_deadline.as_mut().reset(Instant::now() + READINESS_TIMEOUT);
                    match res {
                        Ok((n, src)) => {
                            self.handle_datagram(&udp_buf[..n].to_vec(), src)
                                .await
                                .map_err(TunnelError::runtime)?;
                            self.drain_udp(&mut udp_buf).await?;
                        }
                        Err(e) => return Err(TunnelError::runtime(e)),
                    }
                }

                res = self.tap.read_frame(&mut tap_buf), if tap_enabled => {
                    idle_deadline.as_mut().reset(Instant::now() + READINESS_TIMEOUT);
                    match res {
                        Ok(n) => {
                            self.handle_frame(&tap_buf[..n].to_vec())
                                .await
                                .map_err(TunnelError::runtime)?;
                            self.drain_tap(&mut tap_buf).await?;
                        }
                        Err(e) => return Err(TunnelError::runtime(e)),
                    }
                }

                () = &mut idle_deadline => {
                    idle_deadline.as_mut().reset(Instant::now() + READINESS_TIMEOUT);
                    if self.peer.is_some() {
                        self.send_keepalive().await.map_err(TunnelError::runtime)?;
                    }
                }
            }
        }
    }

    /// Drain any further datagrams already queued on the socket, in the
    /// same tick, without waiting.
    async fn drain_udp(&mut self, buf: &mut [u8; BUF_LEN]) -> Result<(), TunnelError> {
        loop {
            match self.socket.try_recv_from(buf) {
                Ok((n, src)) => {
                    let datagram = buf[..n].to_vec();
                    self.handle_datagram(&datagram, src)
                        .await
                        .map_err(TunnelError::runtime)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(TunnelError::runtime(e)),
            }
        }
    }

    /// Drain any further frames already queued on the TAP fd, in the same
    /// tick, without waiting.
    async fn drain_tap(&mut self, buf: &mut [u8; BUF_LEN]) -> Result<(), TunnelError> {
        loop {
            if self.peer.is_none() {
                return Ok(());
            }
            match self.tap.read_frame(buf).now_or_never() {
                Some(Ok(n)) => {
                    let frame = buf[..n].to_vec();
                    self.handle_frame(&frame).await.map_err(TunnelError::runtime)?;
                }
                Some(Err(e)) => return Err(TunnelError::runtime(e)),
                None => return Ok(()),
            }
        }
    }

    /// Ingress path: UDP datagram to TAP frame.
    async fn handle_datagram(&mut self, datagram: &[u8], src: SocketAddr) -> anyhow::Result<()> {
        let Some(nonce) = Nonce::from_slice(datagram) else {
            debug!(len = datagram.len(), "dropped undersized datagram");
            return Ok(());
        };

        if nonce <= self.n_in {
            debug!(?src, "dropped replayed or out-of-order datagram");
            return Ok(());
        }

        let ciphertext = &datagram[NONCE_LEN..];
        let plaintext = match self.secret.decrypt(&nonce, ciphertext) {
            Ok(p) => p,
            Err(_) => {
                debug!(?src, "dropped datagram failing authentication");
                return Ok(());
            }
        };

        self.n_in = nonce;
        self.accept_peer(src);

        let datagram_len = datagram.len() as u16;
        if datagram_len > self.biggest_rcvd {
            self.biggest_rcvd = datagram_len;
            debug!(biggest_rcvd = self.biggest_rcvd, "updated receive watermark");
        }

        if plaintext.len() >= MIN_FRAME_LEN {
            self.tap
                .write_frame(&plaintext)
                .await
                .context("writing authenticated frame to TAP device")?;
        } else if plaintext.len() == KEEPALIVE_LEN && plaintext[0] == KEEPALIVE_TAG {
            let reported = u16::from_be_bytes([plaintext[1], plaintext[2]]);
            if reported > self.biggest_sent {
                self.biggest_sent = reported;
                debug!(biggest_sent = self.biggest_sent, "peer reports a larger biggest_sent");
            }
        }
        // Any other short plaintext is silently ignored.

        Ok(())
    }

    /// Update `P` and the peer-binding state machine. A no-op for a
    /// connector beyond the state check, since its peer is fixed at startup.
    fn accept_peer(&mut self, src: SocketAddr) {
        if self.role != Role::Listener {
            return;
        }
        if self.peer != Some(src) {
            match self.state {
                PeerState::Unset => info!(peer = %src, "learned peer address, now bound"),
                PeerState::Bound => info!(old = ?self.peer, new = %src, "peer roamed"),
            }
            self.peer = Some(src);
        }
        self.state = PeerState::Bound;
    }

    /// Egress path: TAP frame to UDP datagram.
    async fn handle_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        self.transmit(peer, frame).await
    }

    /// Keepalive sub-protocol.
    async fn send_keepalive(&mut self) -> anyhow::Result<()> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let payload = [
            KEEPALIVE_TAG,
            (self.biggest_rcvd >> 8) as u8,
            (self.biggest_rcvd & 0xFF) as u8,
        ];
        self.transmit(peer, &payload).await?;
        debug!(biggest_rcvd = self.biggest_rcvd, %peer, "sent keepalive");
        Ok(())
    }

    /// Shared encrypt-and-send path for both data frames and keepalives:
    /// advances `N_out`, encrypts, transmits, and updates `biggest_tried`.
    async fn transmit(&mut self, peer: SocketAddr, plaintext: &[u8]) -> anyhow::Result<()> {
        if !self.n_out.increment() {
            anyhow::bail!("nonce counter exhausted for this run's prefix");
        }

        let ciphertext = self.secret.encrypt(&self.n_out, plaintext);
        let mut datagram = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        datagram.extend_from_slice(self.n_out.as_bytes());
        datagram.extend_from_slice(&ciphertext);

        match self.socket.send_to(&datagram, peer).await {
            Ok(_) => {
                let len = datagram.len() as u16;
                if len > self.biggest_tried {
                    self.biggest_tried = len;
                    debug!(biggest_tried = self.biggest_tried, "updated send watermark");
                }
                Ok(())
            }
            Err(e) if is_transient_send_error(&e) => {
                warn!(error = %e, "dropped outgoing datagram (transient send failure)");
                Ok(())
            }
            Err(e) => Err(e).context("sending datagram to peer"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    set_dont_fragment(&socket, &addr);

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Set the don't-fragment bit so path-MTU issues surface as `EMSGSIZE`
/// rather than silent fragmentation.
#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &socket2::Socket, addr: &SocketAddr) {
    use socket2::MtuDiscover;
    let result = if addr.is_ipv4() {
        socket.set_mtu_discover_v4(MtuDiscover::Do)
    } else {
        socket.set_mtu_discover_v6(MtuDiscover::Do)
    };
    if let Err(e) = result {
        warn!(error = %e, "failed to set IP_MTU_DISCOVER=DO; PMTU feedback may be unreliable");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &socket2::Socket, _addr: &SocketAddr) {}

#[cfg(unix)]
fn is_transient_send_error(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(e.raw_os_error(), Some(code) if code == nix::errno::Errno::EMSGSIZE as i32)
}

#[cfg(not(unix))]
fn is_transient_send_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}
