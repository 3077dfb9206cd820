#![doc = include_str!("../README.md")]

pub mod connection;
pub mod error;
pub mod frame;
pub mod limits;
pub mod quic;
pub mod service;
pub mod stream;
mod util;
pub mod varint;
