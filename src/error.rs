use core::fmt;

/// Failure kinds reported by every allocator in this crate.
///
/// `OutOfMemory` is potentially recoverable (release memory elsewhere and retry).
/// `WrongArgument` and `WrongState` signal contract violations by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
  /// The request cannot be satisfied even after growth was attempted.
  OutOfMemory {
    /// Bytes requested, including alignment slack where it applies.
    requested: usize,
    /// Largest request that could have been served at the time of the failure.
    available: usize,
  },
  /// A pointer or parameter that this allocator does not own or cannot accept.
  WrongArgument(&'static str),
  /// The operation is forbidden in the current state (unlock of a lock not held,
  /// out-of-order stack release, double free).
  WrongState(&'static str),
}

impl AllocError {
  pub(crate) const fn out_of_memory(requested: usize, available: usize) -> Self {
    Self::OutOfMemory {
      requested,
      available,
    }
  }

  pub fn is_out_of_memory(&self) -> bool {
    matches!(self, Self::OutOfMemory { .. })
  }
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::OutOfMemory {
        requested,
        available,
      } => write!(
        f,
        "Out of memory: requested {} bytes, but at most {} can be allocated",
        requested, available
      ),
      Self::WrongArgument(desc) => write!(f, "Wrong argument: {}", desc),
      Self::WrongState(desc) => write!(f, "Wrong state: {}", desc),
    }
  }
}

impl std::error::Error for AllocError {}

pub type Result<T> = core::result::Result<T, AllocError>;
