//! Core types for the VALON discovery daemon: the key/label codec and
//! daemon configuration.

pub mod codec;
pub mod config;

pub use codec::{key_to_label, label_to_key, normalize, CodecError};
pub use config::{ConfigError, ValonConfig};
