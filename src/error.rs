use thiserror::Error;

/// Errors that terminate the plugin with a non-zero exit, if they ever
/// reach `main`. Some recoverable conditions (a card that doesn't
/// answer, a failed PIN verification, a bad ECDH) are still constructed
/// as variants of this type where the code that detects them — `card.rs`
/// — has no more specific type to report through, but every call site
/// that can produce one of those variants (`identity_plugin.rs`'s
/// `opener.open`/`card.shared_key` calls) catches it immediately with
/// `log::debug!` and moves on; it is never propagated with `?`. Other
/// recoverable conditions (stale tags, a single malformed stanza) are
/// handled inline and never constructed as this type at all. Treat any
/// variant reaching `main` as fatal regardless of which category it
/// came from.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed command line")]
    MalformedCommandLine,

    #[error("line is too long")]
    LineTooLong,

    #[error("invalid base64 in stanza body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("bad response to request-secret: {0}")]
    BadPromptResponse(String),

    #[error("expected an ok stanza: {0}")]
    NotOk(String),

    #[error("done stanza carried arguments or a body")]
    MalformedDone,

    #[error("unknown age plugin state machine: {0}")]
    UnknownStateMachine(String),

    #[error("bech32 error: {0}")]
    Bech32(#[from] bech32::Error),

    #[error("invalid PIV recipient: {0}")]
    InvalidRecipient(String),

    #[error("invalid PIV identity: {0}")]
    InvalidIdentity(String),

    #[error("PIV card not found")]
    CardNotFound,

    #[error("PIV error: {0}")]
    Piv(#[from] yubikey_piv::Error),
}
