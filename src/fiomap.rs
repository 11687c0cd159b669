//! Concurrent keyed stores shared across workers.
//!
//! [`FioMap`] maps a relative path to the [`Info`] captured for it;
//! [`FioPairMap`] maps a relative path to the source/destination [`Pair`].
//! Both are sharded concurrent maps: `insert`, `get`, `entry` (the
//! load-or-store primitive), `iter` and `len` are safe from any thread, and
//! insertion order is not observable.

use std::sync::Arc;

use dashmap::DashMap;

use crate::info::Info;

/// The stat/lstat info of a pair of related entries in the source and
/// destination trees.
#[derive(Clone, Debug)]
pub struct Pair {
    /// Source side
    pub src: Arc<Info>,
    /// Destination side
    pub dst: Arc<Info>,
}

/// Concurrency safe map of relative path name to the corresponding
/// stat/lstat info.
pub type FioMap = DashMap<String, Arc<Info>>;

/// Concurrency safe map of relative path name to the corresponding
/// stat/lstat info of both the source and the destination.
pub type FioPairMap = DashMap<String, Pair>;

/// Create an empty [`FioMap`].
pub fn new_fio_map() -> FioMap {
    FioMap::new()
}

/// Create an empty [`FioPairMap`].
pub fn new_fio_pair_map() -> FioPairMap {
    FioPairMap::new()
}
