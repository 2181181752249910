//! Secure transport echo server.
//!
//! Accepts TLS connections as configured in a TOML file and echoes
//! length-prefixed frames back to the sender. Useful for interop checks of
//! clients built on the library.
//!
//! ```text
//! frame = u32 big-endian payload length, payload
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use secure_transport::lifecycle::startup;
use secure_transport::{Dispatch, PacketEngine, SecureConnection, SecureReader, TransportError};

/// Frames larger than this are treated as a desynchronised stream.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "secure-transport")]
#[command(about = "TLS echo server for the secure transport layer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "secure-transport.toml")]
    config: PathBuf,
}

struct EchoEngine;

#[async_trait]
impl PacketEngine for EchoEngine {
    async fn receive(
        &self,
        connection: &SecureConnection,
        reader: &mut SecureReader,
    ) -> Result<Dispatch, TransportError> {
        let header = reader.read_bytes(4).await?;
        let length = <[u8; 4]>::try_from(header.as_slice())
            .map(u32::from_be_bytes)
            .map_err(|_| TransportError::Protocol("short frame header".to_string()))?
            as usize;
        if length > MAX_FRAME_LEN {
            return Ok(Dispatch::Unknown);
        }

        let payload = reader.read_bytes(length).await?;
        let mut frame = header;
        frame.extend_from_slice(&payload);
        connection.write_bytes(&frame).await?;
        Ok(Dispatch::Handled)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    startup::run(&cli.config, Arc::new(EchoEngine)).await?;
    Ok(())
}
