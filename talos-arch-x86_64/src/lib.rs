//! The `x86_64` implementation of the talos kernel memory core's page-table
//! backend: a four-level page-table walker driven through the narrow
//! [`cpu::Cpu`] surface, exposed to `talos-vmm` as a
//! [`talos_mem::PageTableBackend`].
#![cfg_attr(not(any(test, feature = "test-util")), no_std)]

pub mod backend;
pub mod cpu;
pub mod table;

pub use backend::{Backend, KMAP_TEMP_VA, SpaceHandle};
pub use cpu::{Cpu, X86Cpu};
