//! Command-line surface and the validated, immutable configuration it
//! produces.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Encrypted Ethernet-over-UDP tunnel between two statically configured peers.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Run as the listening endpoint (learns the peer address on first packet).
    #[arg(short = 'l', long = "listen")]
    listen: bool,

    /// Raise log verbosity (repeatable: -v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Name of the preconfigured TAP interface to attach to.
    tap_name: String,

    /// Path to our 32-byte secret key file (64 hex chars + newline).
    secret_key_file: PathBuf,

    /// Peer address (dotted-quad IPv4 or textual IPv6; not a hostname).
    peer_addr: IpAddr,

    /// UDP port, shared by both endpoints.
    peer_port: u16,

    /// Path to the peer's 32-byte public key file (same format).
    peer_public_key_file: PathBuf,

    /// Path to the 4-byte nonce-prefix counter file.
    nonce_prefix_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

/// Validated, immutable configuration handed to the engine at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub verbosity: u8,
    pub tap_name: String,
    pub secret_key_file: PathBuf,
    pub peer_public_key_file: PathBuf,
    pub nonce_prefix_file: PathBuf,
    /// The peer's address: for a connector this is `P` from startup; for a
    /// listener it is only used to derive `bind_addr`'s family.
    pub peer_addr: SocketAddr,
    /// Local UDP bind address. By convention both endpoints are configured
    /// with the same port number, so this is normally
    /// `0.0.0.0:<peer_addr's port>` / `[::]:<port>`; kept as its own field
    /// so it can be pointed elsewhere in tests without perturbing `P`.
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Parse `std::env::args()` and validate into a `Config`.
    pub fn parse() -> Result<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        if cli.peer_port == 0 || cli.peer_port >= 65534 {
            bail!("UDP port must be in 1..65534, got {}", cli.peer_port);
        }

        let peer_addr = SocketAddr::new(cli.peer_addr, cli.peer_port);

        for (label, path) in [
            ("secret key file", &cli.secret_key_file),
            ("peer public key file", &cli.peer_public_key_file),
            ("nonce-prefix file", &cli.nonce_prefix_file),
        ] {
            if !path.exists() {
                bail!("{label} does not exist: {}", path.display());
            }
        }

        let role = if cli.listen {
            Role::Listener
        } else {
            Role::Connector
        };

        Ok(Config {
            role,
            verbosity: cli.verbose,
            tap_name: cli.tap_name,
            secret_key_file: cli.secret_key_file,
            peer_public_key_file: cli.peer_public_key_file,
            nonce_prefix_file: cli.nonce_prefix_file,
            bind_addr: listen_addr(peer_addr),
            peer_addr,
        })
    }
}

/// Refuse to run as the superuser. Checks the effective UID only
/// (see SPEC_FULL §9): this engine never needs elevated privileges once the
/// administrator-preconfigured TAP fd is attached.
#[cfg(unix)]
pub fn refuse_root() -> Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        bail!("refusing to run as root");
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn refuse_root() -> Result<()> {
    Ok(())
}

/// Bind address for a listener role: all-zeros address of the same family
/// as the configured peer, on the configured port.
pub fn listen_addr(peer_addr: SocketAddr) -> SocketAddr {
    match peer_addr {
        SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), v4.port()),
        SocketAddr::V6(v6) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_preserves_family_and_port() {
        let peer: SocketAddr = "203.0.113.5:9000".parse().unwrap();
        let bind = listen_addr(peer);
        assert_eq!(bind.port(), 9000);
        assert!(bind.ip().is_unspecified());
        assert!(bind.is_ipv4());
    }

    fn cli_with_port(peer_port: u16) -> Cli {
        Cli {
            listen: false,
            verbose: 0,
            tap_name: "tap0".into(),
            secret_key_file: PathBuf::from("/dev/null"),
            peer_addr: "127.0.0.1".parse().unwrap(),
            peer_port,
            peer_public_key_file: PathBuf::from("/dev/null"),
            nonce_prefix_file: PathBuf::from("/dev/null"),
        }
    }

    #[test]
    fn rejects_zero_port() {
        assert!(Config::from_cli(cli_with_port(0)).is_err());
    }

    #[test]
    fn rejects_reserved_upper_ports() {
        assert!(Config::from_cli(cli_with_port(65534)).is_err());
        assert!(Config::from_cli(cli_with_port(65535)).is_err());
    }

    #[test]
    fn accepts_port_just_below_reserved_range() {
        assert!(Config::from_cli(cli_with_port(65533)).is_ok());
    }
}
