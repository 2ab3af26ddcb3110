use std::path::PathBuf;

use anyhow::{Context, Result};
use gpgbridge_common::{AssuanDescriptor, LogicalAgent};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Stand-in backend agent that echoes every byte back
///
/// Publishes an assuan descriptor for each logical agent in the directory
/// given as the first argument (default: `$GNUPGHOME`), so a bridge pointed
/// at the same directory can be exercised without a real gpg-agent.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let home = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("GNUPGHOME"))
        .map(PathBuf::from)
        .context("Usage: echo_backend <gnupg-home>")?;
    std::fs::create_dir_all(&home).with_context(|| format!("Failed to create {}", home.display()))?;

    let mut tasks = Vec::new();
    for agent in [LogicalAgent::Gpg, LogicalAgent::GpgExtra, LogicalAgent::Ssh] {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let descriptor = AssuanDescriptor {
            port:  listener.local_addr()?.port(),
            nonce: *Uuid::new_v4().as_bytes(),
        };
        let path = home.join(agent.descriptor_name());
        std::fs::write(&path, descriptor.encode())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(%agent, port = descriptor.port, path = %path.display(), "descriptor published");
        tasks.push(tokio::spawn(serve(agent, listener, descriptor.nonce)));
    }

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    for task in tasks {
        task.abort();
    }
    for agent in [LogicalAgent::Gpg, LogicalAgent::GpgExtra, LogicalAgent::Ssh] {
        let _ = std::fs::remove_file(home.join(agent.descriptor_name()));
    }
    Ok(())
}

async fn serve(agent: LogicalAgent, listener: TcpListener, nonce: [u8; 16]) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = echo(stream, nonce).await {
                        warn!(%agent, %peer, "connection dropped: {e}");
                    }
                });
            }
            Err(e) => warn!(%agent, "accept failed: {e}"),
        }
    }
}

async fn echo(mut stream: TcpStream, nonce: [u8; 16]) -> Result<()> {
    let mut presented = [0u8; 16];
    stream.read_exact(&mut presented).await?;
    anyhow::ensure!(presented == nonce, "wrong nonce");
    let (mut rd, mut wr) = stream.split();
    tokio::io::copy(&mut rd, &mut wr).await?;
    Ok(())
}
