//! The process handle and the state its entities share

pub mod manager;

pub use manager::Nitrate;
