pub mod audio;
mod cli;
pub mod diagnostics;
pub mod session;
pub mod settings;
pub mod streaming;

pub use cli::run;
