//! UID MOVE command handler (RFC 6851).
//!
//! Moves messages from the selected folder to the destination in one
//! server-side operation. The moved messages get fresh UIDs in the
//! destination, like on a real server.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use super::{parse_uid_set, unquote};
use crate::fake_imap::server::write_line;
use crate::fake_imap::state::ServerState;

/// Handle UID MOVE. `rest` looks like `UID MOVE 1,2 "Backup"`.
pub async fn handle_uid_move<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    rest: &str,
    state: &ServerState,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let set = rest.split_whitespace().nth(2).unwrap_or("");
    let dest = unquote(rest.splitn(4, ' ').nth(3).unwrap_or(""));

    if dest.is_empty() {
        let resp = format!("{tag} BAD Missing destination\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    if !state.has_folder(dest) {
        let resp = format!("{tag} NO [TRYCREATE] Destination folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    let all_uids: Vec<u32> = state.emails(folder_name).iter().map(|e| e.uid).collect();
    let uids = parse_uid_set(set, &all_uids);

    if !state.move_uids(folder_name, &uids, dest) {
        let resp = format!("{tag} NO Source folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    let resp = format!("{tag} OK MOVE completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::MailboxBuilder;

    async fn run(rest: &str, state: &ServerState, selected: Option<&str>) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_uid_move("A1", rest, state, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn moves_messages_to_the_destination() {
        let state = MailboxBuilder::new()
            .folder("Unscanned")
            .email(1, b"one")
            .email(2, b"two")
            .folder("Backup")
            .build();

        let output = run("UID MOVE 1,2 \"Backup\"", &state, Some("Unscanned")).await;

        assert!(output.contains("A1 OK MOVE completed"));
        assert_eq!(state.count("Unscanned"), Some(0));
        assert_eq!(state.count("Backup"), Some(2));
    }

    #[tokio::test]
    async fn partial_sets_move_only_the_named_uids() {
        let state = MailboxBuilder::new()
            .folder("Unscanned")
            .email(1, b"one")
            .email(2, b"two")
            .folder("Backup")
            .build();

        let output = run("UID MOVE 2 \"Backup\"", &state, Some("Unscanned")).await;

        assert!(output.contains("A1 OK MOVE completed"));
        assert_eq!(state.count("Unscanned"), Some(1));
        assert_eq!(state.emails("Unscanned")[0].uid, 1);
        assert_eq!(state.emails("Backup")[0].raw, b"two");
    }

    #[tokio::test]
    async fn missing_destination_returns_trycreate() {
        let state = MailboxBuilder::new()
            .folder("Unscanned")
            .email(1, b"one")
            .build();

        let output = run("UID MOVE 1 \"NoSuch\"", &state, Some("Unscanned")).await;
        assert!(output.contains("TRYCREATE"));
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let state = MailboxBuilder::new().folder("INBOX").build();
        let output = run("UID MOVE 1 \"INBOX\"", &state, None).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }
}
