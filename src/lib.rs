#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod registry;
pub(crate) mod serde_helpers;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::registry::Registry;
pub use crate::types::Message;
pub use crate::ws::ConnectionManager;
