/// Per-vector record attached to every item in a shard.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<MetadataField>,
}

impl Metadata {
    pub fn new<S: Into<String>>(id: S, fields: Vec<MetadataField>) -> Metadata {
        Metadata {
            id: id.into(),
            fields,
        }
    }
}

/// A named, typed field within a `Metadata` record.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct MetadataField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub value: FieldValue,
}

impl MetadataField {
    pub fn named<S: Into<String>>(name: S, value: FieldValue) -> MetadataField {
        MetadataField {
            name: Some(name.into()),
            value,
        }
    }

    pub fn unnamed(value: FieldValue) -> MetadataField {
        MetadataField { name: None, value }
    }
}

/// Primitive values a metadata field can carry.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FieldValue {
    #[serde(rename = "string_val")]
    String(String),

    #[serde(rename = "double_val")]
    Double(f64),

    #[serde(rename = "float_val")]
    Float(f32),

    #[serde(rename = "long_val")]
    Long(i64),

    #[serde(rename = "int_val")]
    Int(i32),

    #[serde(rename = "bool_val")]
    Bool(bool),
}

#[cfg(test)]
mod tests {
    use serde_json;

    use super::FieldValue;
    use super::Metadata;
    use super::MetadataField;

    #[test]
    fn round_trip_primitives() {
        let metadata = Metadata::new(
            "vec-001",
            vec![
                MetadataField::named("title", FieldValue::String("a needle".into())),
                MetadataField::named("score", FieldValue::Double(0.25)),
                MetadataField::named("boost", FieldValue::Float(1.5)),
                MetadataField::named("views", FieldValue::Long(1 << 40)),
                MetadataField::named("rank", FieldValue::Int(-3)),
                MetadataField::unnamed(FieldValue::Bool(true)),
            ],
        );
        let payload = serde_json::to_string(&metadata).unwrap();
        let back: Metadata = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn to_json() {
        let metadata = Metadata::new(
            "vec-002",
            vec![MetadataField::named("lang", FieldValue::String("en".into()))],
        );
        let payload = serde_json::to_string(&metadata).unwrap();
        assert_eq!(
            payload,
            r#"{"id":"vec-002","fields":[{"name":"lang","string_val":"en"}]}"#
        );
    }

    #[test]
    fn empty_fields_skipped() {
        let metadata = Metadata::new("vec-003", Vec::new());
        let payload = serde_json::to_string(&metadata).unwrap();
        assert_eq!(payload, r#"{"id":"vec-003"}"#);
    }
}
