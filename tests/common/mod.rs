#![allow(dead_code)]

pub mod fixtures;
pub mod mock_remote;

pub use fixtures::*;
pub use mock_remote::*;
