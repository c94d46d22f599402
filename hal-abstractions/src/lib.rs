//! Hardware abstraction traits for IoT firmware
//!
//! This crate defines traits that abstract over hardware differences
//! between boards. BSPs implement these traits; the in-memory
//! implementations here back host-side tests.

#![no_std]
#![deny(unsafe_code)]
#![deny(warnings)]

extern crate alloc;

pub mod peripheral;
pub mod rng;
pub mod storage;
