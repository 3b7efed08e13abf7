use std::fmt;

/// Round `x` up to a multiple of `align`
///
/// `align` must be a power of two
pub const fn roundto(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Pointer-sized integer that prints as hex
///
/// Used to put addresses into `tracing` fields without dragging
/// pointer types (and their lack of `Send`) along
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(pub usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}
