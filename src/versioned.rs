//! The version capability every stored value must expose.

use core::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// A value that carries a caller-assigned version number.
///
/// The map never generates versions. For a given key, the versions of
/// accepted writes form a strictly increasing sequence as long as the key
/// stays present; removing the key resets the floor.
pub trait Versioned {
    /// The version of this value.
    fn version(&self) -> u64;
}

impl<T: Versioned + ?Sized> Versioned for &T {
    fn version(&self) -> u64 {
        (**self).version()
    }
}

impl<T: Versioned + ?Sized> Versioned for Box<T> {
    fn version(&self) -> u64 {
        (**self).version()
    }
}

impl<T: Versioned + ?Sized> Versioned for Arc<T> {
    fn version(&self) -> u64 {
        (**self).version()
    }
}

impl<T: Versioned + ?Sized> Versioned for Rc<T> {
    fn version(&self) -> u64 {
        (**self).version()
    }
}

/// A plain value paired with its version.
///
/// Renders as `value@vN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stamped<T> {
    /// The payload.
    pub value: T,
    /// The version of the payload.
    pub version: u64,
}

impl<T> Stamped<T> {
    /// Pairs `value` with `version`.
    pub const fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }

    /// Pairs `value` with version zero.
    pub const fn initial(value: T) -> Self {
        Self::new(value, 0)
    }

    /// The same payload one version later.
    ///
    /// Returns `None` once the version is `u64::MAX`: no later version
    /// exists, so no write could pass the gate over this one anyway.
    pub fn bump(self) -> Option<Self> {
        let version = self.version.checked_add(1)?;
        Some(Self::new(self.value, version))
    }

    /// A new payload at the next version, or `None` at `u64::MAX` as for
    /// [`bump`](Self::bump).
    pub fn succeed<U>(&self, value: U) -> Option<Stamped<U>> {
        let version = self.version.checked_add(1)?;
        Some(Stamped::new(value, version))
    }

    /// Drops the version.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Versioned for Stamped<T> {
    fn version(&self) -> u64 {
        self.version
    }
}

impl<T: fmt::Display> fmt::Display for Stamped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.value, self.version)
    }
}
