pub mod etcd;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod store;

pub use etcd::EtcdStore;
pub use kv::{LockToken, MetaStore, WatchEvent, WatchStream};
pub use lock::DistributedLock;
pub use memory::MemoryStore;
pub use store::{ContainerStatusEvent, Store, StatusStream};
