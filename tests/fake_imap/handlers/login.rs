//! LOGIN command handler. Accepts any credentials, this is a test
//! server.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::fake_imap::server::write_line;

pub async fn handle_login<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stream: &mut BufReader<S>,
) -> bool {
    let resp = format!("{tag} OK [CAPABILITY IMAP4rev1 IDLE MOVE UIDPLUS] LOGIN completed\r\n");
    write_line(stream, &resp).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(tag: &str) -> (String, bool) {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        let ok = handle_login(tag, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        (String::from_utf8(buf).unwrap(), ok)
    }

    #[tokio::test]
    async fn responds_with_ok_and_capabilities() {
        let (output, ok) = run("A0001").await;
        assert!(ok);
        assert!(output.starts_with("A0001 OK"));
        assert!(output.contains("IDLE"));
        assert!(output.contains("MOVE"));
    }
}
