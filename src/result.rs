//! Result and error types for the code generator.

use target_lexicon::Triple;
use thiserror::Error;

/// An error produced while setting up or running code generation.
///
/// Internal IR inconsistencies are not represented here: those abort the
/// process with a panic, since they are compiler bugs rather than conditions
/// a driver can react to.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The requested target is not supported by this backend.
    ///
    /// Only x86-64 System V Linux is implemented.
    #[error("unsupported target triple: {0}")]
    Unsupported(Triple),
}

/// A convenient alias for a `Result` that uses [`CodegenError`].
pub type CodegenResult<T> = Result<T, CodegenError>;
