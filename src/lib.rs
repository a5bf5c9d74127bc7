mod consts;
mod error;

pub mod agent;
pub mod auth1;
pub mod auth2;
pub mod compat;
pub mod dh;
pub mod hostkeys;
pub mod kex;
pub mod keys;
pub mod packet;
pub mod session;
pub mod wire;

pub use crate::error::Error;
