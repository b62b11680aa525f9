//! Final reply to the client and the `QUIT` exchange.

use crate::error::Error;
use crate::relay::SessionId;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const QUEUED_REPLY: &[u8] = b"250 2.0.0 Ok: queued by swiftdrop\r\n";
const BYE_REPLY: &[u8] = b"221 2.0.0 Bye\r\n";
const QUIT: &[u8] = b"QUIT\r\n";

/// Sends the success `reply` and finishes the dialogue with the client.
///
/// Only a failure to send `reply` is an error. Once it is out the message
/// counts as accepted, and anything odd after that is just logged.
pub async fn complete<E>(
    session: SessionId,
    external: &mut E,
    reply: &[u8],
    idle: Duration,
) -> Result<(), Error>
where
    E: AsyncRead + AsyncWrite + Unpin,
{
    external.write_all(reply).await?;
    external.flush().await?;

    let mut buf = [0u8; 4096];
    match timeout(idle, external.read(&mut buf)).await {
        Ok(Ok(0)) => {
            log::warn!("{session} client left without QUIT");
            return Ok(());
        }
        Ok(Ok(n)) => {
            let line = buf.get(..n).unwrap_or_default();
            if line != QUIT {
                log::warn!(
                    "{session} expected QUIT, got {:?}",
                    String::from_utf8_lossy(line)
                );
            }
        }
        Ok(Err(e)) => {
            log::warn!("{session} reading QUIT: {e}");
            return Ok(());
        }
        Err(_) => {
            log::warn!("{session} no QUIT within {idle:?}");
            return Ok(());
        }
    }

    if let Err(e) = external.write_all(BYE_REPLY).await {
        log::debug!("{session} sending 221: {e}");
        return Ok(());
    }

    match timeout(idle, external.read(&mut buf)).await {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => log::warn!("{session} client sent {n} bytes after QUIT"),
        Ok(Err(e)) => log::debug!("{session} after QUIT: {e}"),
        Err(_) => log::warn!("{session} client did not disconnect after QUIT"),
    }

    Ok(())
}
