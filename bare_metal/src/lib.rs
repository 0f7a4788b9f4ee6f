#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;

mod align;
mod addr;
mod bits;

pub mod cpu;
pub mod paging;

pub use self::align::*;
pub use self::addr::*;
pub use self::bits::*;
