pub mod debugger;
pub mod log;
pub mod ui;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
