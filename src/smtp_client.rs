use crate::error::{Error, Peer};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// Replies longer than this are not SMTP.
const MAX_REPLY_SIZE: usize = 65536;

/// Opens the connection to the internal MTA.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    // Disable Nagle's algorithm.
    socket.set_nodelay(true)?;

    Ok(socket.connect(addr).await?)
}

/// Whether `buf` holds a complete reply, i.e. ends in a `NNN text` line.
fn is_complete_reply(buf: &[u8]) -> bool {
    let Some(body) = buf.strip_suffix(b"\r\n") else {
        return false;
    };
    let last_line = match body.windows(2).rposition(|w| w == b"\r\n") {
        Some(pos) => body.get(pos + 2..).unwrap_or_default(),
        None => body,
    };
    last_line.get(3).is_none_or(|&b| b == b' ')
}

/// Reads one (possibly multi-line) reply from the MTA.
pub async fn read_reply<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];

    while !is_complete_reply(&reply) {
        let n = stream.read(&mut buf).await.map_err(|source| Error::SocketError {
            peer: Peer::Mta,
            source,
        })?;
        if n == 0 {
            return Err(Error::PeerDisconnected(Peer::Mta));
        }
        reply.extend_from_slice(buf.get(..n).unwrap_or_default());
        if reply.len() > MAX_REPLY_SIZE {
            return Err(Error::ProtocolViolation("MTA reply too long".to_string()));
        }
    }

    Ok(reply)
}

/// Sends `command` to the MTA and returns its reply.
pub async fn command<S>(stream: &mut S, command: &[u8]) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(command).await?;
    stream.flush().await?;
    read_reply(stream).await
}

/// Checks that `reply` starts with `expected_code`.
pub fn expect(reply: &[u8], context: &str, expected_code: &str) -> Result<(), Error> {
    if reply.starts_with(expected_code.as_bytes()) {
        Ok(())
    } else {
        Err(Error::MailSend {
            context: context.to_string(),
            raw_smtp_answer: String::from_utf8_lossy(reply).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use testresult::TestResult;

    #[rstest]
    #[case("250 2.0.0 Ok\r\n", true)]
    #[case("250 2.0.0 Ok", false)]
    #[case("250-mx.example.org\r\n", false)]
    #[case("250-mx.example.org\r\n250-PIPELINING\r\n250 8BITMIME\r\n", true)]
    #[case("250-mx.example.org\r\n250 8BIT", false)]
    #[case("250\r\n", true)]
    #[case("", false)]
    fn test_is_complete_reply(#[case] reply: &str, #[case] expected: bool) {
        assert_eq!(is_complete_reply(reply.as_bytes()), expected);
    }

    #[tokio::test]
    async fn test_read_reply_across_packets() -> TestResult {
        let (mut mta, mut proxy) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            for part in ["25", "0-first\r\n250 ", "last\r\n"] {
                mta.write_all(part.as_bytes()).await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, std::io::Error>(mta)
        });

        let reply = read_reply(&mut proxy).await?;
        assert_eq!(reply, b"250-first\r\n250 last\r\n");
        let _mta = writer.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_read_reply_disconnect() {
        let (mta, mut proxy) = tokio::io::duplex(1024);
        drop(mta);
        let result = read_reply(&mut proxy).await;
        assert!(matches!(result, Err(Error::PeerDisconnected(Peer::Mta))));
    }

    #[test]
    fn test_expect() {
        assert!(expect(b"250 2.0.0 Ok: queued as X\r\n", "end of DATA", "250 ").is_ok());
        let err = expect(b"554 5.7.1 Rejected\r\n", "end of DATA", "250 ");
        assert!(matches!(
            err,
            Err(Error::MailSend { context, raw_smtp_answer })
                if context == "end of DATA" && raw_smtp_answer.starts_with("554")
        ));
    }
}
