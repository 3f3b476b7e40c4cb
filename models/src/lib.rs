extern crate base64;
extern crate byteorder;
extern crate failure;
extern crate failure_derive;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

pub mod api;

mod cluster;
mod error;
mod metadata;
mod ndarray;

pub use self::cluster::Collection;
pub use self::cluster::DataSource;
pub use self::cluster::IndexDescriptor;
pub use self::cluster::Node;
pub use self::cluster::Replica;
pub use self::cluster::ReplicaState;
pub use self::cluster::Shard;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::metadata::FieldValue;
pub use self::metadata::Metadata;
pub use self::metadata::MetadataField;
pub use self::ndarray::ArrayData;
pub use self::ndarray::Dtype;
pub use self::ndarray::NDArray;
