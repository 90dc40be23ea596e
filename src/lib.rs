//! bulksend: templated bulk SMS and email dispatch from spreadsheets.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod recipient;
pub mod source;
pub mod store;
pub mod template;
pub mod transport;
