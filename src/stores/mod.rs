//! Default implementations of [crate::store::Store]

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
