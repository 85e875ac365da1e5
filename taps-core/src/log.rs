//! Crate-internal logging shims.
//!
//! With the `defmt` feature enabled the macros forward to `defmt`; otherwise
//! the arguments are still type-checked and then discarded. Format strings
//! stick to plain `{}` placeholders so both paths accept them.

#![allow(unused_macros)]

#[cfg(not(feature = "defmt"))]
#[inline]
pub(crate) fn discard(_args: core::fmt::Arguments<'_>) {}

#[cfg(feature = "defmt")]
macro_rules! debug {
    ($($arg:tt)*) => { defmt::debug!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log::discard(core::format_args!($($arg)*)) };
}

#[cfg(feature = "defmt")]
macro_rules! info {
    ($($arg:tt)*) => { defmt::info!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log::discard(core::format_args!($($arg)*)) };
}

#[cfg(feature = "defmt")]
macro_rules! warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log::discard(core::format_args!($($arg)*)) };
}

#[cfg(feature = "defmt")]
macro_rules! error {
    ($($arg:tt)*) => { defmt::error!($($arg)*) };
}

#[cfg(not(feature = "defmt"))]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log::discard(core::format_args!($($arg)*)) };
}
