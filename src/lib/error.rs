//! Recoverable runtime errors

use thiserror::Error;


/// Errors a host can recover from
///
/// Bytecode format defects are not represented here; those panic,
/// and grammar level parse failures are reported through the parser
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
  /// An arena pool hit its configured live object limit
  #[error("{pool} pool exhausted at {limit} live objects")]
  PoolExhausted {
    /// The name of the pool
    pool: &'static str,
    /// The configured limit
    limit: usize,
  },

  /// An integer division had a zero divisor
  #[error("division by zero at instruction {ip}")]
  DivisionByZero {
    /// Offset of the faulting instruction
    ip: usize,
  },

  /// The compiled tables handed to `Program::new` are unusable
  #[error("invalid program: {0}")]
  InvalidProgram(String),

  /// A host call named a frame that does not exist
  #[error("no frame with id {0}")]
  UnknownFrame(usize),

  /// A host call passed the wrong number of arguments
  #[error("frame {frame} takes {expected} arguments, {given} given")]
  ArgumentCount {
    /// The frame being invoked
    frame: usize,
    /// Arguments declared by the frame
    expected: usize,
    /// Arguments supplied by the host
    given: usize,
  },
}

/// Result alias used across the crate
pub type VmResult<T> = Result<T, VmError>;
