//! [`KeyValueBackend`](crate::traits::KeyValueBackend) implementations shipped with the crate.
pub mod memory;
