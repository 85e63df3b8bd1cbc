pub mod token;
pub mod test_utils;

pub use token::*;
