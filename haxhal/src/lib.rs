//! Host and architecture layer of the virtualization engine.
//!
//! The engine proper (`haxcore`) is host-OS agnostic. Everything it needs
//! from the platform — page frames, pinned user memory, KVA mappings, IPI
//! broadcast, preemption control, logging — goes through the [`HostApi`]
//! trait installed once at driver load. This crate also carries the x86-64
//! register accessors and the addressing newtypes shared by both crates.
//!
//! [`HostApi`]: host::HostApi

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(any(test, feature = "mock"))]
extern crate std;

pub mod kprint;

pub mod addressing;
pub mod host;
pub mod mm;
pub mod sync;
pub mod x86;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use addressing::{Pa, Va, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use host::{host, install, HostApi, PreemptGuard};
pub use mm::PageFrame;
pub use sync::SpinLock;
