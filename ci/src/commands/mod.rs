// Compile commands
mod compile;
mod compile_check;

pub use compile::*;
pub use compile_check::*;

mod miri;

pub use doc_test::*;
pub use miri::*;
pub use test::*;

// Lint commands
mod clippy;
mod format;

pub use clippy::*;
pub use format::*;

// Loom test suite commands
mod loom;
mod loom_check;
mod loom_clippy;
mod loom_test;

pub use loom::*;
pub use loom_check::*;
pub use loom_clippy::*;
pub use loom_test::*;
