pub mod fpu;
