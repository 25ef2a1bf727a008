pub mod assert;
pub mod env;
pub mod hint;
pub mod num;
pub mod print;
