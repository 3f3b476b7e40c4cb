use failure::ResultExt;
use serde_json;

use needlestack_models::Metadata;

use super::ErrorKind;
use super::Result;

/// Published form of a shard: the backend's opaque index blob followed by
/// the metadata records, one per row.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct IndexArtifact {
    #[serde(with = "blob_bytes")]
    pub index: Vec<u8>,

    #[serde(default)]
    pub metadatas: Vec<Metadata>,
}

impl IndexArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .with_context(|_| ErrorKind::Artifact("encode failed".into()))?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<IndexArtifact> {
        let artifact = serde_json::from_slice(bytes)
            .with_context(|_| ErrorKind::Artifact("decode failed".into()))?;
        Ok(artifact)
    }
}

mod blob_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use needlestack_models::Metadata;

    use super::IndexArtifact;

    #[test]
    fn round_trip() {
        let artifact = IndexArtifact {
            index: vec![0, 1, 2, 255],
            metadatas: vec![Metadata::new("vec-001", Vec::new())],
        };
        let bytes = artifact.to_bytes().unwrap();
        let back = IndexArtifact::from_bytes(&bytes).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn garbage_rejected() {
        assert!(IndexArtifact::from_bytes(b"not json").is_err());
    }
}
