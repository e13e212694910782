use crate::error::{AllocError, Result};

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Alignment requirement of a memory block. Always a non-zero power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Align(usize);

impl Align {
  /// No alignment requirement.
  pub const ONE: Align = Align(1);

  pub const fn new(value: usize) -> Result<Self> {
    if value.is_power_of_two() {
      Ok(Self(value))
    } else {
      Err(AllocError::WrongArgument(
        "Alignment must be a non-zero power of two",
      ))
    }
  }

  /// Natural alignment of `T`.
  pub const fn of<T>() -> Self {
    Self(core::mem::align_of::<T>())
  }

  #[inline(always)]
  pub const fn value(self) -> usize {
    self.0
  }

  /// Padding in `0..value` that makes `ptr + padding` a multiple of the alignment.
  #[inline(always)]
  pub fn compute_adjustment(self, ptr: *const u8) -> usize {
    let misalignment = ptr as usize & (self.0 - 1);
    if misalignment == 0 {
      0
    } else {
      self.0 - misalignment
    }
  }

  #[inline(always)]
  pub fn aligned(self, ptr: *mut u8) -> *mut u8 {
    ptr.wrapping_add(self.compute_adjustment(ptr))
  }

  /// The stricter of two alignments.
  #[inline(always)]
  pub const fn max(self, other: Align) -> Align {
    if self.0 >= other.0 { self } else { other }
  }
}

impl Default for Align {
  fn default() -> Self {
    Self::ONE
  }
}

impl TryFrom<usize> for Align {
  type Error = AllocError;

  fn try_from(value: usize) -> Result<Self> {
    Self::new(value)
  }
}
