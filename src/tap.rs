//! Attaches to an administrator-preconfigured TAP interface; creating or
//! configuring the interface itself is out of scope here. Exposes async
//! frame read/write over the kernel-provided fd.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tun::AsyncDevice;

/// The TAP-facing half of the engine's I/O surface. Generalized behind a
/// trait so the engine can be driven in tests against an in-memory duplex
/// instead of a real kernel TAP device (see `tests/engine.rs`).
#[async_trait]
pub trait TapIo: Send {
    async fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// An attached TAP device, split into independent read/write halves so the
/// engine's single `select!` loop can poll the read half without holding a
/// lock against concurrent writes.
pub struct TapDevice {
    reader: ReadHalf<AsyncDevice>,
    writer: WriteHalf<AsyncDevice>,
}

impl TapDevice {
    /// Attach to the named interface in layer-2 (Ethernet) mode. Does not
    /// set an address, netmask, or MTU — those are the administrator's
    /// responsibility.
    pub fn attach(name: &str) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config.name(name).layer(tun::Layer::L2).up();

        #[cfg(target_os = "linux")]
        config.platform(|p| {
            p.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .with_context(|| format!("attaching to TAP interface {name}"))?;
        let (reader, writer) = tokio::io::split(device);
        Ok(TapDevice { reader, writer })
    }
}

#[async_trait]
impl TapIo for TapDevice {
    async fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await
    }
}

#[cfg(test)]
pub mod test_support {
    //! An in-memory stand-in for a TAP device, used by the engine's
    //! integration tests in place of a real kernel interface.
    use super::TapIo;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    pub struct DuplexTap(pub DuplexStream);

    #[async_trait]
    impl TapIo for DuplexTap {
        async fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf).await
        }

        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.0.write_all(frame).await
        }
    }
}
