// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
        pub(crate) use loom::thread::yield_now;
        pub(crate) use loom::thread_local;

        #[cfg(test)]
        pub(crate) use loom::sync::Arc;
        #[cfg(test)]
        pub(crate) use loom::thread;
        #[cfg(test)]
        pub(crate) use loom::model;
    } else {
        pub(crate) use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
        pub(crate) use std::thread::yield_now;
        pub(crate) use std::thread_local;

        #[cfg(test)]
        pub(crate) use std::sync::Arc;
        #[cfg(test)]
        pub(crate) use std::thread;

        // When not running under loom, "model" bodies are just executed once
        // as a regular test.
        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<F>(f: F)
        where
            F: Fn() + Sync + Send + 'static,
        {
            f()
        }
    }
}

/// Wraps a `const fn` stripping the "constness" when compiled under loom.
///
/// `loom` tracks additional state alongside each atomic, so constructors
/// that are `const` over `core` atomics cannot be `const` over the loom
/// replacements.
macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis const fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        #[inline]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}

pub(crate) use loom_const_fn;
