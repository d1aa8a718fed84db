pub mod filesystem;
pub mod memory;
mod register;

pub use register::BackendConfigs;
