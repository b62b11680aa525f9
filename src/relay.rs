//! The protocol relay between the external client and the internal MTA.
//!
//! The internal MTA does all of the talking until the client sends `DATA`.
//! At that point the collected recipients decide whether the message is
//! handed to the MTA, diverted to the capture sink, or both.

use crate::boundary::MessageBuffer;
use crate::error::{Error, Peer};
use crate::routing::{Classification, RoutingTable};
use crate::smtp_client;
use crate::utils::recipients_in;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const START_MAIL_INPUT: &[u8] = b"354 End data with <CR><LF>.<CR><LF>\r\n";
const MESSAGE_TOO_LARGE: &[u8] = b"552 5.3.4 Message exceeds maximum size\r\n";
const DATA: &[u8] = b"DATA\r\n";
const RSET: &[u8] = b"RSET\r\n";
const QUIT: &[u8] = b"QUIT\r\n";

const BUFSIZ: usize = 32767;

/// Identifies one proxied connection in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a message is delivered, decided once at `DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only the internal MTA gets the message.
    Passthrough,
    /// Only the capture sink gets the message.
    Capture,
    /// Both get it.
    Mixed,
}

impl Mode {
    fn of(classification: &Classification) -> Self {
        match (
            classification.captured.is_empty(),
            classification.passthrough.is_empty(),
        ) {
            // No recipients at all is treated as capture as well.
            (_, true) => Mode::Capture,
            (true, false) => Mode::Passthrough,
            (false, false) => Mode::Mixed,
        }
    }

    /// Whether the internal MTA receives the message.
    pub fn forwards(self) -> bool {
        self != Mode::Capture
    }
}

/// Timeouts and limits of a relay session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest wait for either side before `DATA`.
    pub idle_timeout: Duration,
    /// Longest wait for the next body chunk; `None` waits forever.
    pub data_timeout: Option<Duration>,
    /// Largest accepted DATA payload in bytes, 0 for no limit.
    pub max_message_size: usize,
}

/// Outcome of a relay session.
#[derive(Debug)]
pub struct Transaction {
    pub mode: Mode,
    /// All recipients in the order the client gave them.
    pub recipients: Vec<String>,
    /// Recipients whose copy goes to the capture sink.
    pub captured: Vec<String>,
    /// DATA payload without the trailing `.\r\n`.
    pub message: Vec<u8>,
    /// Final reply of the internal MTA, if it got the message.
    pub mta_reply: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Setup,
    RouteDecided,
    CollectData(Mode),
    ForwardOrSuppress(Mode),
    Complete(Mode),
}

enum Ready {
    Client(usize),
    Mta(usize),
}

/// A relay session over a client stream and an MTA stream.
pub struct Relay<'a, E, I> {
    session: SessionId,
    external: &'a mut E,
    internal: &'a mut I,
    routing: &'a RoutingTable,
    config: &'a RelayConfig,
    recipients: Vec<String>,
    captured: Vec<String>,
    buffer: MessageBuffer,
    mta_reply: Option<Vec<u8>>,
}

impl<'a, E, I> Relay<'a, E, I>
where
    E: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        session: SessionId,
        external: &'a mut E,
        internal: &'a mut I,
        routing: &'a RoutingTable,
        config: &'a RelayConfig,
    ) -> Self {
        Self {
            session,
            external,
            internal,
            routing,
            config,
            recipients: Vec::new(),
            captured: Vec::new(),
            buffer: MessageBuffer::default(),
            mta_reply: None,
        }
    }

    /// Drives the session until the message is collected and, if needed,
    /// accepted by the internal MTA.
    pub async fn run(mut self) -> Result<Transaction, Error> {
        let mut state = State::Setup;
        let mode = loop {
            log::trace!("{} state {state:?}", self.session);
            state = match state {
                State::Setup => self.setup().await?,
                State::RouteDecided => self.route().await?,
                State::CollectData(mode) => self.collect_data(mode).await?,
                State::ForwardOrSuppress(mode) => self.forward_or_suppress(mode).await?,
                State::Complete(mode) => break mode,
            };
        };

        Ok(Transaction {
            mode,
            recipients: self.recipients,
            captured: self.captured,
            message: self.buffer.into_message(),
            mta_reply: self.mta_reply,
        })
    }

    /// Waits until either side has something to say.
    async fn wait(&mut self, client_buf: &mut [u8], mta_buf: &mut [u8]) -> Result<Ready, Error> {
        let idle = self.config.idle_timeout;
        let external = &mut *self.external;
        let internal = &mut *self.internal;

        let ready = timeout(idle, async {
            tokio::select! {
                r = external.read(client_buf) => r
                    .map(Ready::Client)
                    .map_err(|source| Error::SocketError { peer: Peer::Client, source }),
                r = internal.read(mta_buf) => r
                    .map(Ready::Mta)
                    .map_err(|source| Error::SocketError { peer: Peer::Mta, source }),
            }
        })
        .await
        .map_err(|_| Error::SocketTimeout(idle))??;

        match ready {
            Ready::Client(0) => Err(Error::PeerDisconnected(Peer::Client)),
            Ready::Mta(0) => Err(Error::PeerDisconnected(Peer::Mta)),
            ready => Ok(ready),
        }
    }

    /// Relays both directions verbatim until the client sends `DATA`.
    async fn setup(&mut self) -> Result<State, Error> {
        let mut client_buf = vec![0u8; BUFSIZ];
        let mut mta_buf = vec![0u8; BUFSIZ];

        loop {
            match self.wait(&mut client_buf, &mut mta_buf).await? {
                Ready::Client(n) => {
                    let chunk = client_buf.get(..n).unwrap_or_default();
                    log::debug!("{} >>> {n} bytes", self.session);

                    if chunk == DATA {
                        return Ok(State::RouteDecided);
                    }

                    self.recipients.extend(recipients_in(chunk)?);
                    self.internal.write_all(chunk).await?;
                }
                Ready::Mta(n) => {
                    log::debug!("{} <<< {n} bytes", self.session);
                    let chunk = mta_buf.get(..n).unwrap_or_default();
                    self.external.write_all(chunk).await?;
                }
            }
        }
    }

    /// Classifies the recipients and answers `DATA` accordingly.
    async fn route(&mut self) -> Result<State, Error> {
        let classification = self.routing.classify(&self.recipients);
        let mode = Mode::of(&classification);
        log::info!(
            "{} {} recipient(s), {} captured, {} passthrough: {mode:?}",
            self.session,
            self.recipients.len(),
            classification.captured.len(),
            classification.passthrough.len(),
        );
        self.captured = classification.captured;

        if mode.forwards() {
            let reply = smtp_client::command(self.internal, DATA).await?;
            self.external.write_all(&reply).await?;
            smtp_client::expect(&reply, "DATA", "354 ")?;
        } else {
            self.external.write_all(START_MAIL_INPUT).await?;
            // The MTA connection is of no further use.
            if let Err(e) = self.release_mta(RSET).await {
                log::warn!("{} releasing MTA connection: {e}", self.session);
            }
        }

        Ok(State::CollectData(mode))
    }

    /// Sends `command` followed by `QUIT`, ignoring the replies.
    async fn release_mta(&mut self, command: &[u8]) -> Result<(), Error> {
        smtp_client::command(self.internal, command).await?;
        smtp_client::command(self.internal, QUIT).await?;
        Ok(())
    }

    async fn read_client(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let read = self.external.read(buf);
        let result = match self.config.data_timeout {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| Error::SocketTimeout(limit))?,
            None => read.await,
        };
        result.map_err(|source| Error::SocketError {
            peer: Peer::Client,
            source,
        })
    }

    /// Reads the message body from the client up to the terminator.
    async fn collect_data(&mut self, mode: Mode) -> Result<State, Error> {
        let mut buf = vec![0u8; BUFSIZ];

        loop {
            let n = self.read_client(&mut buf).await?;
            if n == 0 {
                return Err(Error::PeerDisconnected(Peer::Client));
            }
            self.buffer.push(buf.get(..n).unwrap_or_default().to_vec());

            let limit = self.config.max_message_size;
            if limit != 0 && self.buffer.len() > limit {
                self.external.write_all(MESSAGE_TOO_LARGE).await?;
                return Err(Error::MessageTooLarge(limit));
            }

            if self.buffer.is_complete() {
                log::debug!("{} collected {} bytes", self.session, self.buffer.len());
                return Ok(State::ForwardOrSuppress(mode));
            }
        }
    }

    /// Replays the body to the MTA when it takes part in delivery.
    async fn forward_or_suppress(&mut self, mode: Mode) -> Result<State, Error> {
        if !mode.forwards() {
            return Ok(State::Complete(mode));
        }

        for chunk in self.buffer.chunks() {
            self.internal.write_all(chunk).await?;
        }
        self.internal.flush().await?;

        let reply = smtp_client::read_reply(self.internal).await?;
        smtp_client::expect(&reply, "end of DATA", "250 ")?;
        self.mta_reply = Some(reply);

        // Done with the MTA, do not wait for the client to QUIT.
        if let Err(e) = smtp_client::command(self.internal, QUIT).await {
            log::debug!("{} QUIT to MTA: {e}", self.session);
        }

        Ok(State::Complete(mode))
    }
}
