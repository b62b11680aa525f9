//! End-of-DATA detection over a fragmented byte stream.

/// The sequence ending an SMTP DATA payload.
pub const TERMINATOR: &[u8] = b"\r\n.\r\n";

/// Returns the last `count` bytes of the concatenation of `chunks`.
///
/// Only the trailing chunks needed to cover `count` bytes are touched, the
/// buffer as a whole is never joined. Fewer bytes are returned if the chunks
/// hold less than `count` bytes in total.
pub fn last_bytes(chunks: &[Vec<u8>], count: usize) -> Vec<u8> {
    if let Some(last) = chunks.last()
        && last.len() >= count
    {
        return last
            .get(last.len() - count..)
            .unwrap_or_default()
            .to_vec();
    }

    // Tail spread over several short chunks.
    let mut pieces: Vec<&[u8]> = Vec::new();
    let mut have = 0;
    for chunk in chunks.iter().rev() {
        let take = (count - have).min(chunk.len());
        pieces.push(chunk.get(chunk.len() - take..).unwrap_or_default());
        have += take;
        if have == count {
            break;
        }
    }

    pieces.iter().rev().flat_map(|p| p.iter().copied()).collect()
}

/// DATA payload collected chunk by chunk, as read from the client.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl MessageBuffer {
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total number of bytes received so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Whether the payload ends with the DATA terminator.
    ///
    /// The CRLF closing the `DATA` command line doubles as the leading CRLF
    /// of the terminator, so a bare `.\r\n` is an empty message.
    pub fn is_complete(&self) -> bool {
        if self.len == TERMINATOR.len() - 2 {
            return last_bytes(&self.chunks, 3) == b".\r\n";
        }
        last_bytes(&self.chunks, TERMINATOR.len()) == TERMINATOR
    }

    /// Joins the payload, dropping the trailing `.\r\n`.
    pub fn into_message(self) -> Vec<u8> {
        let mut message = self.chunks.concat();
        message.truncate(self.len.saturating_sub(3));
        message
    }
}
