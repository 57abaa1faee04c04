//! The single error type shared by buffers, the session and every layer.

use crate::backend::Residency;

/// All failures the engine reports.
///
/// None of these are retried internally. An unavailable accelerator is not
/// an error at all: the session simply reports itself as disabled.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed layer configuration, e.g. initial weights of the wrong length.
    #[error("configuration error: {0}")]
    Config(String),

    /// No kernel source is registered under this identity.
    #[error("no kernel source registered for `{0}`")]
    MissingKernel(String),

    /// The kernel source failed validation on load.
    #[error("kernel source for `{identity}` is invalid: {reason}")]
    InvalidKernel {
        /// Identity the source was registered or requested under.
        identity: String,
        /// What the validation rejected.
        reason: String,
    },

    /// Program compilation failed; `log` holds the backend diagnostics.
    #[error("failed to build kernels for `{identity}`:\n{log}")]
    Build {
        /// Identity of the program being built.
        identity: String,
        /// Compiler diagnostics.
        log: String,
    },

    /// Composing a kernel template failed.
    #[error("template error: {0}")]
    Template(String),

    /// The operation is not available at the buffer's current residency.
    #[error("unsupported operation `{op}` while {residency:?}-resident")]
    Unsupported {
        /// The refused operation.
        op: &'static str,
        /// Where the buffer lived at the time.
        residency: Residency,
    },

    /// A write or copy did not match the buffer length.
    #[error("length mismatch: expected {expected} elements, got {got}")]
    LengthMismatch {
        /// Buffer length.
        expected: usize,
        /// Length supplied.
        got: usize,
    },

    /// Tensor shapes disagree with what the operation requires.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape the operation needs.
        expected: Vec<usize>,
        /// Shape it was given.
        got: Vec<usize>,
    },

    /// A call-site precondition was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The buffer was released and can no longer be used.
    #[error("buffer used after release")]
    Disposed,

    /// No auxiliary buffer is registered under this name.
    #[error("no buffer named `{0}`")]
    NotFound(String),

    /// The accelerator refused a device, an allocation or a launch.
    #[error("accelerator error: {0}")]
    Accelerator(String),

    /// Mapping a staging buffer for read-back failed.
    #[error("buffer map failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),

    /// Waiting on the device failed.
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;
