pub mod api;
pub mod camera;
pub mod config;
pub mod error;
pub mod logging;
pub mod pose;
pub mod protocol;
pub mod render;
pub mod session;
pub mod socket;

#[cfg(test)]
pub(crate) mod testing;
