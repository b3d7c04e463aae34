#![warn(rust_2018_idioms)]
/// manager
pub mod manager;
pub use manager::Manager;

pub mod web;
