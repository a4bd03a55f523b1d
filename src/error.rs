use thiserror::Error;

/// Structural and decode failures raised by the ELF and DWARF layers.
///
/// Everything here converts into `anyhow::Error` at the call site; the
/// variants exist so tests and the unwinder can tell a truncated read
/// from an unimplemented encoding when walking the error chain.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("short read from {source_name} at offset {offset:#x}: wanted {wanted} bytes")]
    ShortRead {
        source_name: String,
        offset: u64,
        wanted: usize,
    },

    #[error("value out of range: {0}")]
    FormatError(String),

    #[error("not an ELF image")]
    NotAnElf,

    #[error("bad ELF header: {0}")]
    BadHeader(String),

    #[error("malformed section {0}: {1}")]
    MalformedSection(String, String),

    #[error("unsupported DWARF form {0:#x}")]
    UnsupportedForm(u64),

    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("unsupported address encoding {0:#x}")]
    UnsupportedEncoding(u8),

    #[error("bad call frame information: {0}")]
    BadCfi(String),

    #[error("expression error: {0}")]
    ExpressionError(String),
}
