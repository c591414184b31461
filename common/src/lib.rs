pub mod assembler;
pub mod config;
pub mod frame;
