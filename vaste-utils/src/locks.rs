//! Lock aliases so the lock vendor is swappable in one place.

/// A synchronous mutex.
pub type SyncMutex<T> = parking_lot::Mutex<T>;
/// A synchronous read-write lock.
pub type SyncRwLock<T> = parking_lot::RwLock<T>;

/// An asynchronous mutex.
pub type AsyncMutex<T> = tokio::sync::Mutex<T>;
/// An asynchronous read-write lock.
pub type AsyncRwLock<T> = tokio::sync::RwLock<T>;
