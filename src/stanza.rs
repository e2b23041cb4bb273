//! The age plugin wire protocol: framed `-> TYPE ARGS\n<base64-body>\n`
//! units read from and written to a pair of byte streams.
//!
//! Grounded on `internal/ageplugin/ageplugin.go` in the upstream Go
//! implementation, reimplemented in idiomatic Rust.

use std::io::{self, BufRead, BufReader, Read, Write};

use crate::error::Error;

const CMD_PREFIX: &str = "-> ";
const BODY_LINE_LIMIT: usize = 64;

/// One framed unit of the plugin protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub kind: String,
    pub args: Vec<String>,
    pub body: Vec<u8>,
}

impl Stanza {
    pub fn new(kind: impl Into<String>, args: Vec<String>, body: Vec<u8>) -> Self {
        Stanza {
            kind: kind.into(),
            args,
            body,
        }
    }
}

/// A stanza codec over a reader/writer pair. One instance per plugin
/// invocation; the reader is buffered, the writer is not (stanzas are
/// written in full, single `write` calls per line).
pub struct Conn<R, W> {
    r: BufReader<R>,
    w: W,
}

impl<R: Read, W: Write> Conn<R, W> {
    pub fn new(r: R, w: W) -> Self {
        Conn {
            r: BufReader::new(r),
            w,
        }
    }

    /// Reads the next stanza. Returns `Ok(None)` on a clean end of input
    /// at a stanza boundary (zero bytes read before EOF) — the caller
    /// decides whether that's graceful. Any other EOF position, or any
    /// framing violation, is a fatal `Error`.
    pub fn read_stanza(&mut self) -> Result<Option<Stanza>, Error> {
        let mut line = String::new();
        let n = self.r.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            return Err(Error::UnexpectedEof);
        }
        if !line.starts_with(CMD_PREFIX) {
            return Err(Error::MalformedCommandLine);
        }
        let line = &line[CMD_PREFIX.len()..line.len() - 1];
        let mut parts = line.split(' ');
        let kind = parts.next().unwrap_or("").to_string();
        let args: Vec<String> = parts.map(|s| s.to_string()).collect();

        let mut encoded = String::new();
        loop {
            let mut body_line = String::new();
            let n = self.r.read_line(&mut body_line)?;
            if n == 0 || !body_line.ends_with('\n') {
                return Err(Error::UnexpectedEof);
            }
            let body_line = &body_line[..body_line.len() - 1];
            if body_line.len() > BODY_LINE_LIMIT {
                return Err(Error::LineTooLong);
            }
            let short = body_line.len() < BODY_LINE_LIMIT;
            encoded.push_str(body_line);
            if short {
                break;
            }
        }
        let body = base64::decode_config(&encoded, base64::STANDARD_NO_PAD)?;

        Ok(Some(Stanza { kind, args, body }))
    }

    /// Writes a stanza: `-> TYPE ARG...\n<base64 body>\n`.
    pub fn write_stanza(&mut self, s: &Stanza) -> Result<(), Error> {
        let mut line = String::from(CMD_PREFIX);
        line.push_str(&s.kind);
        for arg in &s.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        self.w.write_all(line.as_bytes())?;

        let encoded = base64::encode_config(&s.body, base64::STANDARD_NO_PAD);
        self.w.write_all(encoded.as_bytes())?;
        self.w.write_all(b"\n")?;
        Ok(())
    }

    /// Issues a `request-secret` stanza carrying `question` as its body,
    /// then blocks for the host's `ok` response and returns the secret.
    pub fn prompt(&mut self, question: &str) -> Result<String, Error> {
        self.write_stanza(&Stanza::new(
            "request-secret",
            vec![],
            question.as_bytes().to_vec(),
        ))?;
        let reply = self
            .read_stanza()?
            .ok_or(Error::UnexpectedEof)?;
        if reply.kind != "ok" || !reply.args.is_empty() || reply.body.is_empty() {
            return Err(Error::BadPromptResponse(reply.kind));
        }
        Ok(String::from_utf8_lossy(&reply.body).into_owned())
    }

    /// Reads the next stanza and requires it to be a bare `ok`.
    pub fn read_ok(&mut self) -> Result<(), Error> {
        let s = self.read_stanza()?.ok_or(Error::UnexpectedEof)?;
        if s.kind != "ok" || !s.args.is_empty() || !s.body.is_empty() {
            return Err(Error::NotOk(s.kind));
        }
        Ok(())
    }

    /// Consumes the connection, returning the writer half. Used by
    /// tests to inspect what was written.
    pub fn into_writer(self) -> W {
        self.w
    }
}

/// A writer that swallows broken-pipe errors instead of propagating
/// them, so a host that closes its end of the pipe doesn't kill us with
/// SIGPIPE/EPIPE before we can observe the disconnect as a read error.
/// Mirrors `ignoreEPIPEWriter` in the upstream `cmd/age-plugin-yubikey/main.go`.
pub struct IgnoreBrokenPipe<W> {
    inner: W,
}

impl<W> IgnoreBrokenPipe<W> {
    pub fn new(inner: W) -> Self {
        IgnoreBrokenPipe { inner }
    }
}

impl<W: Write> Write for IgnoreBrokenPipe<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(buf.len()),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.flush() {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }
}
