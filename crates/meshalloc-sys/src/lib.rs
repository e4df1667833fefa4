#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod math;
pub mod prim;
pub mod span;
pub mod system;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod unix;

pub mod prelude {
  pub use super::{
    math::{
      align_down,
      align_up,
      is_aligned,
    },
    prim::{
      is_page_aligned,
      page_align,
      page_align_down,
      page_size,
    },
    span::{
      Orphan,
      Span,
    },
    system::{
      SysError,
      SysResult,
      System,
      default_system,
    },
  };
}
