//! Accepts client connections and runs one proxy session per connection.

use crate::error::Error;
use crate::handshake::{self, QUEUED_REPLY};
use crate::relay::{Mode, Relay, RelayConfig, SessionId};
use crate::routing::{Resolution, RoutingTable};
use crate::sink::{CaptureSink, Uploader};
use crate::smtp_client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Read-only state shared by all sessions.
#[derive(Debug)]
pub struct Proxy<S> {
    pub mta_addr: SocketAddr,
    pub relay: RelayConfig,
    pub routing: Arc<RoutingTable>,
    pub uploader: Uploader<S>,
}

/// Runs the proxy on the specified address.
pub async fn run_smtp_server<S>(addr: SocketAddr, proxy: Arc<Proxy<S>>) -> Result<(), Error>
where
    S: CaptureSink + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    log::info!("entering serving loop on {addr}, relaying to {}", proxy.mta_addr);
    serve(listener, proxy).await;
    Ok(())
}

/// Accepts connections forever, one detached task per connection.
pub async fn serve<S>(listener: TcpListener, proxy: Arc<Proxy<S>>)
where
    S: CaptureSink + 'static,
{
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Error accepting connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let proxy = proxy.clone();
        let session = SessionId::next();
        tokio::spawn(async move {
            log::debug!("{session} connection from {peer}");
            match handle_connection(session, socket, &proxy).await {
                Ok(()) => log::info!("{session} done"),
                Err(e) => log::error!("{session} ERR {e}"),
            }
        });
    }
}

/// Handles an individual client connection.
async fn handle_connection<S>(
    session: SessionId,
    mut external: TcpStream,
    proxy: &Proxy<S>,
) -> Result<(), Error>
where
    S: CaptureSink,
{
    let mut internal = smtp_client::connect(proxy.mta_addr).await?;
    let result = proxy_session(session, &mut external, &mut internal, proxy).await;

    if let Err(e) = internal.shutdown().await {
        log::debug!("{session} closing MTA connection: {e}");
    }
    result
}

/// Relays one session, uploads what was captured and completes the dialogue.
///
/// The client only gets a success reply if every required upload succeeded.
pub async fn proxy_session<E, I, S>(
    session: SessionId,
    external: &mut E,
    internal: &mut I,
    proxy: &Proxy<S>,
) -> Result<(), Error>
where
    E: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + AsyncWrite + Unpin,
    S: CaptureSink,
{
    let transaction = Relay::new(session, external, internal, &proxy.routing, &proxy.relay)
        .run()
        .await?;

    log::debug!(
        "{session} {:?} message of {} bytes for {:?}",
        transaction.mode,
        transaction.message.len(),
        transaction.recipients
    );

    let reply = match transaction.mode {
        Mode::Passthrough => transaction
            .mta_reply
            .unwrap_or_else(|| QUEUED_REPLY.to_vec()),
        Mode::Capture | Mode::Mixed => {
            proxy
                .uploader
                .upload(
                    &transaction.captured,
                    &transaction.message,
                    Resolution::Strict,
                )
                .await?;
            QUEUED_REPLY.to_vec()
        }
    };

    handshake::complete(session, external, &reply, proxy.relay.idle_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::START_MAIL_INPUT;
    use crate::relay::testing::{
        MTA_QUEUED, MTA_START_MAIL_INPUT, client_envelope, contains, fake_mta,
    };
    use crate::routing::destination;
    use crate::sink::testing::RecordingSink;
    use crate::smtp_client::{command, read_reply};
    use testresult::TestResult;
    use tokio::sync::mpsc;

    const BODY: &str = "From: s@example.org\r\nSubject: t\r\n\r\nbody\r\n";

    struct Harness {
        proxy: Arc<Proxy<RecordingSink>>,
        addr: SocketAddr,
        transcripts: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Starts a fake MTA and the proxy on ephemeral loopback ports.
    async fn start(sink: RecordingSink) -> TestResult<Harness> {
        let mta = TcpListener::bind("127.0.0.1:0").await?;
        let mta_addr = mta.local_addr()?;
        let (tx, transcripts) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((socket, _)) = mta.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(transcript) = fake_mta(socket, MTA_QUEUED).await {
                        let _ = tx.send(transcript);
                    }
                });
            }
        });

        let routing = Arc::new(RoutingTable::new(
            vec![destination("D1", &["a@x"]), destination("D2", &["c@x"])],
            None,
        ));
        let proxy = Arc::new(Proxy {
            mta_addr,
            relay: RelayConfig {
                idle_timeout: Duration::from_secs(5),
                data_timeout: None,
                max_message_size: 0,
            },
            routing: routing.clone(),
            uploader: Uploader::new(routing, sink),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve(listener, proxy.clone()));

        Ok(Harness {
            proxy,
            addr,
            transcripts,
        })
    }

    /// A full client conversation. Returns the `DATA` reply and the reply to
    /// the end of the message.
    async fn send_mail(addr: SocketAddr, recipients: &[&str]) -> TestResult<(Vec<u8>, Vec<u8>)> {
        let mut client = TcpStream::connect(addr).await?;
        let data_reply = client_envelope(&mut client, recipients).await?;
        let final_reply = command(&mut client, format!("{BODY}.\r\n").as_bytes()).await?;
        let bye = command(&mut client, b"QUIT\r\n").await?;
        assert!(bye.starts_with(b"221 "));
        Ok((data_reply, final_reply))
    }

    #[tokio::test]
    async fn test_capture_session() -> TestResult {
        let mut harness = start(RecordingSink::default()).await?;
        let (data_reply, final_reply) = send_mail(harness.addr, &["a@x", "c@x", "A@x"]).await?;

        assert_eq!(data_reply, START_MAIL_INPUT);
        assert_eq!(final_reply, QUEUED_REPLY);

        let uploads = harness.proxy.uploader.sink().uploads();
        let names: Vec<&str> = uploads.iter().map(|u| u.0.as_str()).collect();
        assert_eq!(names, vec!["D1", "D2"]);
        assert!(uploads.iter().all(|u| u.2 == BODY.as_bytes()));

        let transcript = harness.transcripts.recv().await.unwrap_or_default();
        assert!(contains(&transcript, b"RSET\r\n"));
        assert!(!contains(&transcript, b"body"));
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_session() -> TestResult {
        let mut harness = start(RecordingSink::default()).await?;
        let (data_reply, final_reply) = send_mail(harness.addr, &["a@x", "b@y"]).await?;

        assert_eq!(data_reply, MTA_START_MAIL_INPUT);
        assert_eq!(final_reply, QUEUED_REPLY);
        assert_eq!(harness.proxy.uploader.sink().uploads().len(), 1);

        let transcript = harness.transcripts.recv().await.unwrap_or_default();
        assert!(contains(&transcript, BODY.as_bytes()));
        Ok(())
    }

    #[tokio::test]
    async fn test_passthrough_session() -> TestResult {
        let mut harness = start(RecordingSink::default()).await?;
        let (data_reply, final_reply) = send_mail(harness.addr, &["b@y"]).await?;

        assert_eq!(data_reply, MTA_START_MAIL_INPUT);
        assert_eq!(final_reply, MTA_QUEUED);
        assert!(harness.proxy.uploader.sink().uploads().is_empty());

        let transcript = harness.transcripts.recv().await.unwrap_or_default();
        assert!(contains(&transcript, BODY.as_bytes()));
        Ok(())
    }

    /// A failed session gets no success reply and does not affect the next.
    #[tokio::test]
    async fn test_failed_upload_withholds_reply() -> TestResult {
        let harness = start(RecordingSink::failing(&["D2"])).await?;

        let mut client = TcpStream::connect(harness.addr).await?;
        client_envelope(&mut client, &["a@x", "c@x"]).await?;
        let result = command(&mut client, format!("{BODY}.\r\n").as_bytes()).await;
        assert!(result.is_err());
        // D1 was still attempted.
        assert_eq!(harness.proxy.uploader.sink().uploads().len(), 1);

        let (_, final_reply) = send_mail(harness.addr, &["a@x"]).await?;
        assert_eq!(final_reply, QUEUED_REPLY);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_recipients_withholds_reply() -> TestResult {
        let harness = start(RecordingSink::default()).await?;

        let mut client = TcpStream::connect(harness.addr).await?;
        read_reply(&mut client).await?;
        command(&mut client, b"EHLO client.example.org\r\n").await?;
        let data_reply = command(&mut client, b"DATA\r\n").await?;
        assert_eq!(data_reply, START_MAIL_INPUT);

        let result = command(&mut client, format!("{BODY}.\r\n").as_bytes()).await;
        assert!(result.is_err());
        assert!(harness.proxy.uploader.sink().uploads().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_during_data_uploads_nothing() -> TestResult {
        let harness = start(RecordingSink::default()).await?;

        let mut client = TcpStream::connect(harness.addr).await?;
        client_envelope(&mut client, &["a@x"]).await?;
        client.write_all(b"Subject: cut short\r\n").await?;
        drop(client);

        let (_, final_reply) = send_mail(harness.addr, &["c@x"]).await?;
        assert_eq!(final_reply, QUEUED_REPLY);
        let uploads = harness.proxy.uploader.sink().uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "D2");
        Ok(())
    }
}
