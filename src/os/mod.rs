pub mod mem;
pub mod thread;
