//! cinnabar: a small teaching operating system kernel core.
//!
//! User processes on a flat address space with demand-paged virtual
//! memory, a FAT-style cluster-chained filesystem with hierarchical
//! directories and symlinks, and a single-CPU preemptive scheduler with
//! priority donation (or an MLFQS policy). The machine — console, disks,
//! context switching — sits behind the HAL, so the same kernel core runs
//! under an embedder's boot environment or against in-memory devices in
//! the test suite.

#![cfg_attr(not(test), no_std)]
//
// # Lints.
#![deny(anonymous_parameters)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(non_ascii_idents)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_import_braces)]

extern crate alloc;

pub mod elf;
pub mod error;
pub mod file;
pub mod fixedpoint;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod lock;
pub mod memlayout;
pub mod param;
pub mod process;
pub mod syscall;
pub mod thread;
pub mod vm;
