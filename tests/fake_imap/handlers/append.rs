//! APPEND command handler.
//!
//! APPEND transfers the message as a counted literal. The client sends
//! `APPEND "folder" ... {size}` and waits for a `+` continuation
//! before transmitting exactly `size` raw bytes. With a LITERAL+
//! marker (`{size+}`) the client skips the continuation round-trip;
//! both forms are accepted here.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::fake_imap::server::write_line;
use crate::fake_imap::state::ServerState;

/// Handle APPEND. `rest` looks like
/// `APPEND "INBOX" "01-Jan-2024 12:00:00 +0000" {321}`.
pub async fn handle_append<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    rest: &str,
    state: &ServerState,
    stream: &mut BufReader<S>,
) {
    let Some(folder) = first_quoted(rest).or_else(|| rest.split_whitespace().nth(1).map(String::from))
    else {
        let resp = format!("{tag} BAD Missing folder\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let Some((size, synchronizing)) = literal_size(rest) else {
        let resp = format!("{tag} BAD Missing literal\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    if !state.has_folder(&folder) {
        let resp = format!("{tag} NO [TRYCREATE] Folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    if synchronizing && write_line(stream, "+ Ready for literal data\r\n").await.is_err() {
        return;
    }

    let mut raw = vec![0u8; size];
    if stream.read_exact(&mut raw).await.is_err() {
        return;
    }

    // the literal is followed by the command's terminating CRLF
    let mut trailer = String::new();
    let _ = stream.read_line(&mut trailer).await;

    state.append(&folder, raw);

    let resp = format!("{tag} OK APPEND completed\r\n");
    let _ = write_line(stream, &resp).await;
}

/// The content of the first double-quoted argument.
fn first_quoted(rest: &str) -> Option<String> {
    let start = rest.find('"')?;
    let end = rest[start + 1..].find('"')?;
    Some(rest[start + 1..start + 1 + end].to_string())
}

/// Parse the trailing `{size}` or `{size+}` literal marker. Returns
/// the size and whether the literal is synchronizing (needs a `+`
/// continuation).
fn literal_size(rest: &str) -> Option<(usize, bool)> {
    let open = rest.rfind('{')?;
    let close = rest[open..].find('}')? + open;
    let inner = &rest[open + 1..close];

    match inner.strip_suffix('+') {
        Some(size) => Some((size.parse().ok()?, false)),
        None => Some((inner.parse().ok()?, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::MailboxBuilder;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn parses_literal_markers() {
        assert_eq!(literal_size("APPEND \"INBOX\" {42}"), Some((42, true)));
        assert_eq!(literal_size("APPEND \"INBOX\" {42+}"), Some((42, false)));
        assert_eq!(literal_size("APPEND \"INBOX\""), None);
    }

    #[test]
    fn extracts_the_folder_name() {
        assert_eq!(
            first_quoted("APPEND \"My Folder\" {1}"),
            Some("My Folder".to_string())
        );
        assert_eq!(first_quoted("APPEND INBOX {1}"), None);
    }

    #[tokio::test]
    async fn stores_the_literal_bytes() {
        let state = MailboxBuilder::new().folder("INBOX").build();

        let (mut client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        let body = b"Subject: x\r\n\r\nhello";
        let writer = tokio::spawn(async move {
            // wait for the continuation, then send literal + CRLF
            let mut buf = [0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with('+'));

            client.write_all(body).await.unwrap();
            client.write_all(b"\r\n").await.unwrap();

            // drain the tagged response
            let mut out = Vec::new();
            let _ = client.read_to_end(&mut out).await;
            String::from_utf8(out).unwrap()
        });

        let rest = format!("APPEND \"INBOX\" {{{}}}", body.len());
        handle_append("A1", &rest, &state, &mut stream).await;
        drop(stream);

        let response = writer.await.unwrap();
        assert!(response.contains("A1 OK APPEND completed"));

        let emails = state.emails("INBOX");
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].raw, body);
    }
}
