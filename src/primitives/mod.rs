pub mod rand;

pub use rand::*;
