pub(crate) mod backing;
pub(crate) mod block_pool;
pub(crate) mod buddy;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod policy;
pub(crate) mod pool_box;
pub(crate) mod size_class;
pub(crate) mod small_object;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
