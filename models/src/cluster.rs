/// A searcher process addressable by `host:port`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Node {
    pub hostport: String,
}

impl Node {
    pub fn new<S: Into<String>>(hostport: S) -> Node {
        Node {
            hostport: hostport.into(),
        }
    }
}

/// Lifecycle state of one replica, as persisted in the coordination store.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Booting,
    Active,
    Down,
    Recovering,
}

/// One copy of a shard living on a specific node.
///
/// The state is absent on listings that skip replica payloads
/// (`include_state=false`); persisted replica znodes always carry it.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Replica {
    pub node: Node,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ReplicaState>,
}

impl Replica {
    pub fn new<S: Into<String>>(hostport: S, state: ReplicaState) -> Replica {
        Replica {
            node: Node::new(hostport),
            state: Some(state),
        }
    }

    pub fn stateless<S: Into<String>>(hostport: S) -> Replica {
        Replica {
            node: Node::new(hostport),
            state: None,
        }
    }
}

/// How a shard's index is built and where its data lives.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDescriptor {
    /// Exact flat index over L2 distance.
    Flat(DataSource),
}

impl IndexDescriptor {
    pub fn data_source(&self) -> &DataSource {
        match self {
            IndexDescriptor::Flat(source) => source,
        }
    }
}

/// Location of a shard's published index artifact.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    LocalFile {
        path: String,
    },
    Blob {
        bucket: String,
        object: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
}

/// A subset of a collection's vectors plus its kNN index; the unit of
/// placement.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,

    #[serde(default = "Shard::default_weight")]
    pub weight: f64,

    pub index: IndexDescriptor,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<Replica>,
}

impl Shard {
    pub fn new<S: Into<String>>(name: S, weight: f64, index: IndexDescriptor) -> Shard {
        Shard {
            name: name.into(),
            weight,
            index,
            replicas: Vec::new(),
        }
    }

    /// Copy of this shard without replicas, as persisted on the shard znode.
    pub fn descriptor(&self) -> Shard {
        Shard {
            name: self.name.clone(),
            weight: self.weight,
            index: self.index.clone(),
            replicas: Vec::new(),
        }
    }

    fn default_weight() -> f64 {
        1.0
    }
}

/// A named logical dataset of vectors, partitioned into shards.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,

    #[serde(default = "Collection::default_replication_factor")]
    pub replication_factor: u32,

    #[serde(default)]
    pub enable_id_to_vector: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<Shard>,
}

impl Collection {
    pub fn new<S: Into<String>>(name: S, replication_factor: u32, shards: Vec<Shard>) -> Collection {
        Collection {
            name: name.into(),
            replication_factor,
            enable_id_to_vector: false,
            shards,
        }
    }

    /// Copy of this collection without shards, as persisted on the
    /// collection znode.
    pub fn descriptor(&self) -> Collection {
        Collection {
            name: self.name.clone(),
            replication_factor: self.replication_factor,
            enable_id_to_vector: self.enable_id_to_vector,
            shards: Vec::new(),
        }
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|shard| shard.name == name)
    }

    fn default_replication_factor() -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use serde_json;

    use super::Collection;
    use super::DataSource;
    use super::IndexDescriptor;
    use super::Replica;
    use super::ReplicaState;
    use super::Shard;

    fn sample_collection() -> Collection {
        let source = DataSource::LocalFile {
            path: "/data/c1/shard_a.json".into(),
        };
        let mut shard = Shard::new("shard_a", 20.0, IndexDescriptor::Flat(source));
        shard.replicas.push(Replica::new("n1:50051", ReplicaState::Active));
        let mut collection = Collection::new("c1", 2, vec![shard]);
        collection.enable_id_to_vector = true;
        collection
    }

    #[test]
    fn replica_state_wire_format() {
        let payload = serde_json::to_string(&ReplicaState::Booting).unwrap();
        assert_eq!(payload, r#""BOOTING""#);
        let state: ReplicaState = serde_json::from_str(r#""RECOVERING""#).unwrap();
        assert_eq!(state, ReplicaState::Recovering);
    }

    #[test]
    fn round_trip() {
        let collection = sample_collection();
        let payload = serde_json::to_string(&collection).unwrap();
        let back: Collection = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, collection);
    }

    #[test]
    fn descriptor_strips_children() {
        let collection = sample_collection();
        assert!(collection.descriptor().shards.is_empty());
        assert!(collection.shards[0].descriptor().replicas.is_empty());
        assert_eq!(collection.descriptor().name, "c1");
    }

    #[test]
    fn weight_defaults() {
        let payload = r#"{"name":"s1","index":{"flat":{"local_file":{"path":"/x"}}}}"#;
        let shard: Shard = serde_json::from_str(payload).unwrap();
        assert_eq!(shard.weight, 1.0);
    }
}
