use serde::{Deserialize, Serialize};

use crate::marshal::CapData;

/// Persisted record of a durable kind, under `vom.dkind.<id>.descriptor`.
///
/// `unfaceted` and `facets` are both absent until the kind is first
/// defined; afterwards exactly one of them is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableKindDescriptor {
    #[serde(rename = "kindID")]
    pub kind_id: u64,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfaceted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_shape_cap_data: Option<CapData>,
}

impl DurableKindDescriptor {
    pub fn new(kind_id: u64, tag: &str) -> Self {
        Self {
            kind_id,
            tag: tag.to_string(),
            unfaceted: None,
            facets: None,
            state_shape_cap_data: None,
        }
    }

    pub fn key(kind_id: u64) -> String {
        format!("vom.dkind.{}.descriptor", kind_id)
    }

    pub fn next_id_key(kind_id: u64) -> String {
        format!("vom.dkind.{}.nextID", kind_id)
    }
}

/// Diagnostic record of a virtual kind, under `vom.vkind.<id>.descriptor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualKindDescriptor {
    #[serde(rename = "kindID")]
    pub kind_id: u64,
    pub tag: String,
}

impl VirtualKindDescriptor {
    pub fn key(kind_id: u64) -> String {
        format!("vom.vkind.{}.descriptor", kind_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_descriptor_json() {
        let desc = DurableKindDescriptor::new(10, "widget");
        assert_eq!(
            serde_json::to_string(&desc).unwrap(),
            r#"{"kindID":10,"tag":"widget"}"#
        );
    }

    #[test]
    fn test_descriptor_field_names() {
        let mut desc = DurableKindDescriptor::new(11, "kit");
        desc.facets = Some(vec!["bar".to_string(), "foo".to_string()]);
        desc.state_shape_cap_data = Some(CapData::new("\"null\"", vec![]));
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains(r#""facets":["bar","foo"]"#));
        assert!(json.contains(r#""stateShapeCapData":"#));
        let back: DurableKindDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
