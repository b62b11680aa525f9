use crate::error::Error;

const RCPT_TO: &[u8] = b"RCPT TO:<";

/// Extracts the address between the first `<` and the first `>` after it.
///
/// The address is lower-cased. Returns `None` if there is no such pair.
pub fn extract_address(line: &[u8]) -> Option<String> {
    let open = line.iter().position(|&b| b == b'<')?;
    let rest = line.get(open + 1..)?;
    let close = rest.iter().position(|&b| b == b'>')?;
    let address = rest.get(..close)?;

    std::str::from_utf8(address).ok().map(str::to_lowercase)
}

/// Collects the recipients of every `RCPT TO:<...>` line in a client chunk.
///
/// A `RCPT TO:<` line without a closing `>` is a protocol violation.
pub fn recipients_in(chunk: &[u8]) -> Result<Vec<String>, Error> {
    chunk
        .split(|&b| b == b'\n')
        .filter(|line| line.starts_with(RCPT_TO))
        .map(|line| {
            extract_address(line).ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "malformed recipient line {:?}",
                    String::from_utf8_lossy(line)
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("RCPT TO:<t1@example.org>\r\n", Some("t1@example.org"))]
    #[case("RCPT TO:<T2@Example.ORG> NOTIFY=NEVER\r\n", Some("t2@example.org"))]
    #[case("RCPT TO:<SRS0=abc=example.com=alice@example.net>\r\n", Some("srs0=abc=example.com=alice@example.net"))]
    #[case("RCPT TO:<>\r\n", Some(""))]
    #[case("RCPT TO:<a@b> ORCPT=rfc822;<c@d>\r\n", Some("a@b"))]
    #[case("RCPT TO:<broken@example.org\r\n", None)]
    #[case("RCPT TO:broken@example.org\r\n", None)]
    fn test_extract_address(#[case] input: &str, #[case] expected: Option<&str>) {
        let result = extract_address(input.as_bytes());
        assert_eq!(result.as_deref(), expected)
    }

    #[test]
    fn test_recipients_in_pipelined_chunk() {
        let chunk = b"MAIL FROM:<s@example.org>\r\nRCPT TO:<a@x>\r\nRCPT TO:<B@Y>\r\n";
        let recipients = recipients_in(chunk).unwrap();
        assert_eq!(recipients, vec!["a@x", "b@y"]);
    }

    #[rstest]
    #[case("EHLO mx.example.org\r\n")]
    #[case("MAIL FROM:<s@example.org>\r\n")]
    #[case("rcpt to:<lower@example.org>\r\n")]
    #[case("XFORWARD NAME=x ADDR=127.0.0.1\r\n")]
    fn test_other_lines_yield_nothing(#[case] input: &str) {
        assert!(recipients_in(input.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_recipient_is_violation() {
        let result = recipients_in(b"RCPT TO:<nobody\r\n");
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }
}
