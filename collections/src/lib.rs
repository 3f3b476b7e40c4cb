extern crate failure;
extern crate failure_derive;
#[macro_use]
extern crate slog;

extern crate needlestack_coordinator;
extern crate needlestack_index;
extern crate needlestack_models;

#[cfg(test)]
extern crate serde_json;
#[cfg(test)]
extern crate tempfile;

mod collection;
mod error;
mod manager;

pub use self::collection::Collection;
pub use self::collection::Shard;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::manager::CollectionEntry;
pub use self::manager::LocalCollectionManager;
pub use self::manager::ReconcileStats;
