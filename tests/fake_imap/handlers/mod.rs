//! One handler per IMAP command.
//!
//! Handlers receive the pre-parsed tag and the command remainder, the
//! shared mailbox state and the connection stream. Responses follow
//! RFC 3501 framing: untagged `*` data lines first, then the tagged
//! completion.

mod append;
mod login;
mod r#move;

pub use append::handle_append;
pub use fetch::handle_uid_fetch;
pub use idle::handle_idle;
pub use login::handle_login;
pub use r#move::handle_uid_move;
pub use select::handle_select;

/// Strip surrounding double quotes from an IMAP astring argument.
pub(crate) fn unquote(arg: &str) -> &str {
    arg.trim().trim_matches('"')
}

/// Parse a UID set like `5`, `1,3,9` or `1:*`. `*`/ranges resolve
/// against `all`, the UIDs currently in the folder.
pub(crate) fn parse_uid_set(set: &str, all: &[u32]) -> Vec<u32> {
    let mut uids = Vec::new();

    for part in set.split(',') {
        let part = part.trim();

        if let Some((from, to)) = part.split_once(':') {
            let Ok(from) = from.parse::<u32>() else {
                continue;
            };
            let to = match to {
                "*" => u32::MAX,
                n => n.parse::<u32>().unwrap_or(0),
            };
            uids.extend(all.iter().copied().filter(|u| (from..=to).contains(u)));
        } else if let Ok(uid) = part.parse::<u32>() {
            if all.contains(&uid) {
                uids.push(uid);
            }
        }
    }

    uids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_uids_and_lists() {
        let all = [1, 2, 5, 9];
        assert_eq!(parse_uid_set("5", &all), vec![5]);
        assert_eq!(parse_uid_set("1,9", &all), vec![1, 9]);
        assert_eq!(parse_uid_set("7", &all), Vec::<u32>::new());
    }

    #[test]
    fn parses_ranges_and_star() {
        let all = [1, 2, 5, 9];
        assert_eq!(parse_uid_set("1:*", &all), vec![1, 2, 5, 9]);
        assert_eq!(parse_uid_set("2:5", &all), vec![2, 5]);
    }

    #[test]
    fn unquotes_astrings() {
        assert_eq!(unquote("\"INBOX\""), "INBOX");
        assert_eq!(unquote("INBOX"), "INBOX");
        assert_eq!(unquote(" \"My Folder\" "), "My Folder");
    }
}
