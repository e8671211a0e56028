//! Client-side state: the session store and the storage it persists to.

pub mod session;
pub mod storage;
