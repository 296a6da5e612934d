pub mod counter;
pub mod error;
pub mod flash;
