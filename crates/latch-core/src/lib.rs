//! Latch hooking engine
//!
//! Redirects compiled methods through a chain of hook functions: resolves a
//! method's stable native entry (navigating the runtime's precode and tiered
//! compilation thunks), allocates executable memory within rel32 reach,
//! assembles a trampoline that calls every registered hook with each argument
//! by reference, and patches the method entry with a jump through a
//! toggleable indirect cell.
//!
//! ```no_run
//! use std::sync::Arc;
//! use latch_common::{HookDescriptor, MethodSig};
//! use latch_core::{HookingEnv, NativeFunction};
//!
//! extern "win64" fn area(w: i64, h: i64) -> i64 { w * h }
//! extern "win64" fn clamp(w: *mut i64, h: *mut i64, out: *mut i64) -> bool {
//!     unsafe { *w = (*w).min(100); }
//!     true
//! }
//!
//! # fn main() -> latch_common::Result<()> {
//! let env = HookingEnv::with_defaults();
//! let target = NativeFunction::new(
//!     "area",
//!     area as usize,
//!     MethodSig::function(&["i64", "i64"], Some("i64")),
//! )?;
//! let hook = env.hook(Arc::new(target))?;
//! hook.add_hook(&HookDescriptor::new(
//!     "clamp",
//!     clamp as usize,
//!     MethodSig::hook(&["i64", "i64", "i64"]),
//! ))?;
//! hook.enable();
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod arch;
pub mod caves;
pub mod chain;
pub mod env;
pub mod indirects;
pub mod method;
pub mod precode;
pub mod regions;
pub mod registry;
pub mod resolver;
pub mod routines;
pub mod stub;
pub mod vm;

pub use env::{EnvConfig, HookingEnv};
pub use latch_common::{Error, Result};
pub use method::NativeFunction;
pub use registry::MethodHook;
pub use resolver::{JitWatcher, NativeState, Resolver};
