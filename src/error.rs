use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into three groups: stream decoding failures (the input body is damaged or
/// truncated), configuration failures (a registered patch asks for something the target function
/// cannot provide), and installation failures (the platform refused a memory operation while the
/// detour was being written).
///
/// Decoding and configuration errors abort composition before anything is installed; sorting
/// ambiguity is never an error and surfaces as diagnostics on the sorter instead.
///
/// # Examples
///
/// ```rust,ignore
/// use cilhook::Error;
///
/// match context.apply(&function, patches) {
///     Ok(outcome) => println!("replacement at {:#x}", outcome.replacement),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("damaged body: {} ({}:{})", message, file, line);
///     }
///     Err(Error::Configuration { owner, function, message }) => {
///         eprintln!("patch {} cannot apply to {}: {}", owner, function, message);
///     }
///     Err(e) => eprintln!("{}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The instruction stream is damaged and could not be decoded.
    ///
    /// The error includes the source location where the malformation was
    /// detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading the stream.
    ///
    /// This error occurs when trying to read data beyond the end of the
    /// body buffer. It's a safety check to prevent overruns on truncated
    /// or malformed input.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// The requested operation is not supported on this platform or target.
    #[error("This operation is not supported")]
    NotSupported,

    /// A registered patch is incompatible with the target function.
    ///
    /// These are caller mistakes in how a hook declares its injected
    /// parameters or its return type, detected during synthesis. The
    /// owning patch and the target function are named so the caller can
    /// locate the offending registration.
    #[error("Patch '{owner}' cannot apply to '{function}': {message}")]
    Configuration {
        /// Identifier of the patch whose declaration is invalid
        owner: String,
        /// Display name of the function being patched
        function: String,
        /// What about the declaration was rejected
        message: String,
    },

    /// The platform refused a memory operation while installing a detour.
    ///
    /// Wraps the underlying OS error together with the address whose page
    /// could not be made writable or whose bytes could not be written.
    #[error("Failed to install detour at {address:#x}: {message}")]
    Install {
        /// Address the installer was operating on
        address: usize,
        /// Description of the underlying platform failure
        message: String,
    },

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when a lock guarding shared patch state is in an invalid state.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for
    /// wrapping collaborator errors with additional context.
    #[error("{0}")]
    Error(String),
}
