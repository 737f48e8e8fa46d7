pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use ports::{HttpClientPort, HttpGetResult};
