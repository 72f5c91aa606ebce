//! Entry point: parse the command line, load key material, precompute the
//! shared secret, bump the nonce prefix, and hand off to the engine's
//! readiness loop.

mod config;
mod crypto;
mod engine;
mod error;
mod keys;
mod nonce;
mod tap;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use config::Config;
use crypto::SharedSecretBox;
use engine::TunnelEngine;
use error::TunnelError;

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("tappet: {e}");
            e.exit_code()
        }
    });
}

#[tokio::main]
async fn run() -> Result<(), TunnelError> {
    let config = Config::parse().map_err(TunnelError::Startup)?;
    init_logging(config.verbosity);

    config::refuse_root().map_err(TunnelError::Startup)?;

    let secret = keys::read_key_file(&config.secret_key_file).map_err(TunnelError::Startup)?;
    let peer_public =
        keys::read_key_file(&config.peer_public_key_file).map_err(TunnelError::Startup)?;
    let prefix =
        keys::bump_nonce_prefix(&config.nonce_prefix_file).map_err(TunnelError::Startup)?;

    let shared = SharedSecretBox::precompute(&secret, &peer_public);

    let engine = TunnelEngine::new(&config, shared, prefix)
        .await
        .map_err(TunnelError::Startup)?;

    engine.run().await
}

/// Verbosity is cumulative (`-v`, `-vv`, ...); absent, `info` and above are
/// shown. Respects `RUST_LOG` if set, same as the rest of the corpus this
/// crate is drawn from.
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
