mod client;
mod connection;
mod deferred;
mod error;
mod monitor;
mod policy;
mod reactor;
mod util;

pub mod mock;

pub use client::*;
pub use connection::*;
pub use deferred::*;
pub use error::*;
pub use policy::*;
pub use reactor::*;
