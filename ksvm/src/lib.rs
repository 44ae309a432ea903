//! Build kickstart installation images and drive the VM that installs from them.

pub mod cmd;
pub mod config;
pub mod console;
pub mod http;
pub mod port;
pub mod progress;
pub mod source;
pub mod vm;
