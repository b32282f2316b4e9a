#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_ret_no_self)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod hook;
pub mod svm;
pub mod utils;

#[cfg(target_os = "windows")]
pub mod nt;

#[cfg(test)]
mod tests;
