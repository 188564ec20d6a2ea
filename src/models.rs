use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;

/// Producer-side ids arrive either as JSON strings or bare integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Text(String),
    Number(i64),
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Text(value) => f.write_str(value),
            ItemId::Number(value) => write!(f, "{value}"),
        }
    }
}

/// One candidate outcome of an attribute sub-task.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateValue {
    #[serde(rename = "Identifier")]
    pub identifier: String,
    #[serde(rename = "Bezeichner")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One attribute sub-task of a work item.
///
/// `resolved_value` distinguishes "not yet processed" (absent) from
/// "processed but failed" (explicit null) via the double `Option`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeTask {
    #[serde(rename = "Identifier")]
    pub identifier: String,
    #[serde(rename = "Bezeichner")]
    pub description: Option<String>,
    #[serde(rename = "Orientierung")]
    pub orientation: Option<String>,
    #[serde(rename = "Attributwerte")]
    pub candidates: Option<Vec<CandidateValue>>,
    #[serde(
        rename = "Ausgewaehlter Attributwert (Result)",
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub resolved_value: Option<Option<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "Bezeichnung")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One unit of work: a product description with its media references and the
/// attribute sub-tasks awaiting classification. Unknown producer fields are
/// carried through untouched in `extra`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(rename = "ProduktID")]
    pub product_id: ItemId,
    #[serde(rename = "FarbID")]
    pub colour_id: Option<ItemId>,
    #[serde(rename = "Hauptbild")]
    pub main_image: Option<String>,
    #[serde(rename = "Freisteller Back")]
    pub back_image: Option<String>,
    #[serde(rename = "Modellbild")]
    pub model_image: Option<String>,
    #[serde(rename = "Klassifikation", default)]
    pub classification: Vec<Classification>,
    #[serde(rename = "Geschlecht")]
    pub target_group: Option<String>,
    #[serde(rename = "Klassifikations-Attribute", default)]
    pub attributes: Vec<AttributeTask>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl WorkItem {
    /// The 0-3 media references, in producer order, empty entries dropped.
    pub fn media_references(&self) -> Vec<&str> {
        [
            self.main_image.as_deref(),
            self.back_image.as_deref(),
            self.model_image.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|url| !url.trim().is_empty())
        .collect()
    }

    /// Short label of the first classification entry, e.g. "D-Hosen".
    pub fn product_category(&self) -> Option<&str> {
        self.classification
            .first()
            .and_then(|entry| entry.label.as_deref())
    }
}

// Maps an explicit JSON null to `Some(None)`; an absent field stays `None`
// through `#[serde(default)]`.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "ProduktID": 80416852,
        "FarbID": "F123",
        "Hauptbild": "https://img.example.com/main.jpg",
        "Freisteller Back": "https://img.example.com/back.jpg",
        "Geschlecht": "Damen",
        "Klassifikation": [{"Bezeichnung": "D-Hosen / D-Freizeithosen"}],
        "Klassifikations-Attribute": [
            {
                "Identifier": "kragenform",
                "Bezeichner": "Form des Kragens",
                "Orientierung": "oberer Bildbereich",
                "Attributwerte": [
                    {"Identifier": "v", "Bezeichner": "V-Ausschnitt"},
                    {"Identifier": "rund", "Bezeichner": "Rundhals"}
                ]
            },
            {"Identifier": "farbHex"}
        ],
        "Lieferant": "ACME Moden"
    }"#;

    #[test]
    fn deserializes_producer_shape() {
        let item: WorkItem = serde_json::from_str(SAMPLE).expect("parse sample");
        assert_eq!(item.product_id, ItemId::Number(80416852));
        assert_eq!(item.media_references().len(), 2);
        assert_eq!(item.product_category(), Some("D-Hosen / D-Freizeithosen"));
        assert_eq!(item.attributes.len(), 2);
        assert!(item.attributes[0].resolved_value.is_none());
        assert!(item.attributes[1].candidates.is_none());
        assert_eq!(
            item.extra.get("Lieferant"),
            Some(&Value::String("ACME Moden".into()))
        );
    }

    #[test]
    fn round_trip_preserves_unknown_fields() {
        let item: WorkItem = serde_json::from_str(SAMPLE).expect("parse sample");
        let serialized = serde_json::to_string_pretty(&item).expect("serialize");
        let reparsed: WorkItem = serde_json::from_str(&serialized).expect("reparse");
        assert_eq!(reparsed.extra.get("Lieferant"), item.extra.get("Lieferant"));
        assert_eq!(reparsed.attributes[0].candidates.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn absent_result_is_not_serialized() {
        let item: WorkItem = serde_json::from_str(SAMPLE).expect("parse sample");
        let serialized = serde_json::to_string(&item).expect("serialize");
        assert!(!serialized.contains("Ausgewaehlter Attributwert"));
    }

    #[test]
    fn null_result_survives_round_trip() {
        let mut item: WorkItem = serde_json::from_str(SAMPLE).expect("parse sample");
        item.attributes[0].resolved_value = Some(None);
        item.attributes[1].resolved_value = Some(Some("#1a1a1a".into()));
        let serialized = serde_json::to_string(&item).expect("serialize");
        let reparsed: WorkItem = serde_json::from_str(&serialized).expect("reparse");
        assert_eq!(reparsed.attributes[0].resolved_value, Some(None));
        assert_eq!(
            reparsed.attributes[1].resolved_value,
            Some(Some("#1a1a1a".into()))
        );
    }
}
