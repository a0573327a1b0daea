//! Mail header rendering and in-place insertion
//!
//! Inserting scan-result headers into a message must not touch the
//! body, so the message file is streamed in chunks while looking for
//! the CRLF CRLF sequence that separates the header section from the
//! body. The rewritten message is built in a sibling temp file and
//! atomically renamed over the original.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Max. allowed number of bytes per line of an e-mail, *including* the
/// terminating CRLF
/// (<https://datatracker.ietf.org/doc/html/rfc5322#section-2.1.1>).
const MAX_LINE_LENGTH: usize = 1000;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// A single mail header field, rendered as `name ": " body CRLF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub body: String,
}

impl Header {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

fn is_header_char(b: u8, forbid_colon: bool) -> bool {
    (33..=126).contains(&b) && !(forbid_colon && b == b':')
}

/// Renders a header field to a CRLF-terminated line.
///
/// Name and body must consist of printable US-ASCII only, the name must
/// not contain a colon, and the rendered line must not exceed
/// [`MAX_LINE_LENGTH`] bytes. The charset is stricter than RFC 5322
/// requires but is sufficient for the machine-generated headers this
/// engine emits, and guarantees the result parses everywhere.
pub fn render_header(name: &str, body: &str) -> Result<Vec<u8>> {
    if !name.bytes().all(|b| is_header_char(b, true)) {
        return Err(Error::InvalidHeader(format!(
            "header name {name:?} contains an invalid character"
        )));
    }

    if !body.bytes().all(|b| is_header_char(b, false)) {
        return Err(Error::InvalidHeader(format!(
            "header body {body:?} contains an invalid character"
        )));
    }

    let mut line = Vec::with_capacity(name.len() + body.len() + 4);
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(b": ");
    line.extend_from_slice(body.as_bytes());
    line.extend_from_slice(b"\r\n");

    if line.len() > MAX_LINE_LENGTH {
        return Err(Error::InvalidHeader(format!(
            "header {name:?} is too long ({} bytes)",
            line.len()
        )));
    }

    Ok(line)
}

/// Renders a list of header fields to a block of CRLF-terminated lines.
pub fn render_headers(headers: &[Header]) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(headers.len() * 64);

    for hdr in headers {
        block.extend_from_slice(&render_header(&hdr.name, &hdr.body)?);
    }

    Ok(block)
}

/// Inserts a pre-rendered header block at the end of the header section
/// of the message at `path`, atomically replacing the file.
///
/// `headers` must consist of CRLF-terminated lines as produced by
/// [`render_headers`]. On any failure the original file is left
/// untouched.
pub fn insert_headers(path: &Path, headers: &[u8]) -> Result<()> {
    let input = File::open(path)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;

    insert_into(BufReader::new(input), tmp.as_file(), headers)?;

    tmp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

/// Copies the message from `input` to `output` with `headers` spliced
/// in before the blank line that starts the body.
///
/// The CRLF CRLF sentinel may straddle a read boundary, so the last
/// three bytes of each chunk are carried over into the next search
/// window. A message without a header/body separator is an error.
fn insert_into<R: Read, W: Write>(mut input: R, output: W, headers: &[u8]) -> Result<()> {
    let mut out = BufWriter::new(output);
    let mut buf = [0u8; 4096];
    let mut tail: Vec<u8> = Vec::new();

    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Err(Error::HeaderEndNotFound);
        }

        let mut window = tail;
        window.extend_from_slice(&buf[..n]);

        if let Some(idx) = find_header_end(&window) {
            // up to and including the CRLF terminating the last header line
            out.write_all(&window[..idx + 2])?;
            out.write_all(headers)?;
            // the remainder starts with the CRLF that opens the body
            out.write_all(&window[idx + 2..])?;
            io::copy(&mut input, &mut out)?;
            out.flush()?;
            return Ok(());
        }

        let keep = window.len().saturating_sub(HEADER_END.len() - 1);
        out.write_all(&window[..keep])?;
        window.drain(..keep);
        tail = window;
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}
