//! Core entity model, name normalization and record flattening for chemfetch.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "chemfetch-core";

pub type JsonMap = Map<String, JsonValue>;

/// Characters dropped (together with all whitespace) before names are compared.
const NAME_SEPARATORS: &[char] = &['-', '_', ',', '.', ';', ':', '/'];

/// Case folding applied by [`normalize_name`].
///
/// `Lower` keys are used when scoring search candidates, `Upper` keys when
/// checking membership in a fixed target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCase {
    Lower,
    Upper,
}

pub fn normalize_name(input: &str, case: NameCase) -> String {
    let kept = input
        .chars()
        .filter(|c| !c.is_whitespace() && !NAME_SEPARATORS.contains(c));
    match case {
        NameCase::Lower => kept.flat_map(char::to_lowercase).collect(),
        NameCase::Upper => kept.flat_map(char::to_uppercase).collect(),
    }
}

/// Normalizes a JSON value that is expected to hold a name. Anything that is
/// not a string yields an empty key.
pub fn normalize_json_name(value: &JsonValue, case: NameCase) -> String {
    value
        .as_str()
        .map(|s| normalize_name(s, case))
        .unwrap_or_default()
}

/// Exact-set filter over uppercase-normalized names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetNames {
    keys: BTreeSet<String>,
}

impl TargetNames {
    pub fn contains(&self, name: &str) -> bool {
        let key = normalize_name(name, NameCase::Upper);
        !key.is_empty() && self.keys.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for TargetNames {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|name| normalize_name(name.as_ref(), NameCase::Upper))
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }
}

/// Tentative search match, scored before a canonical id is chosen.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Option<String>,
    pub preferred_name: Option<String>,
    pub synonyms: Vec<String>,
    pub external_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub raw_name: String,
    pub canonical_id: Option<String>,
    pub resolved: bool,
}

impl ResolvedEntity {
    pub fn resolved(raw_name: impl Into<String>, canonical_id: impl Into<String>) -> Self {
        Self {
            raw_name: raw_name.into(),
            canonical_id: Some(canonical_id.into()),
            resolved: true,
        }
    }

    pub fn unresolved(raw_name: impl Into<String>) -> Self {
        Self {
            raw_name: raw_name.into(),
            canonical_id: None,
            resolved: false,
        }
    }
}

/// Response body of a JSON endpoint, classified once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Absent,
    Structured(JsonMap),
    RawText(String),
}

impl Payload {
    pub fn is_absent(&self) -> bool {
        matches!(self, Payload::Absent)
    }

    pub fn as_structured(&self) -> Option<&JsonMap> {
        match self {
            Payload::Structured(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.as_structured().and_then(|map| map.get(key))
    }
}

/// Binary or text asset fetched for a canonical id. Bytes are not serialized
/// into the aggregate output; only their size and media type are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub content_type: String,
    pub byte_len: usize,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl Asset {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            byte_len: bytes.len(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NetworkError,
    MalformedResponse,
    WriteError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::WriteError => "write_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline step an error annotation belongs to. `Unit` covers a unit that
/// died before producing its own record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Detail,
    Relation,
    Activities,
    Mechanisms,
    Asset,
    Persist,
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl RecordError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

/// Everything gathered for one input name. Exactly one is produced per input,
/// whether or not the name could be resolved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub raw_name: String,
    pub canonical_id: Option<String>,
    pub detail: Payload,
    pub relation: Payload,
    pub activities: Vec<JsonMap>,
    pub mechanisms: Vec<JsonMap>,
    pub asset: Option<Asset>,
    #[serde(default)]
    pub errors: Vec<RecordError>,
}

impl EnrichmentRecord {
    pub fn unresolved(raw_name: impl Into<String>, error: RecordError) -> Self {
        Self {
            raw_name: raw_name.into(),
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.canonical_id.is_some()
    }

    /// First error annotation, in stage order.
    pub fn error(&self) -> Option<&RecordError> {
        self.errors.first()
    }

    pub fn with_error(mut self, error: RecordError) -> Self {
        self.errors.push(error);
        self
    }
}

pub const FLAT_COLUMNS: [&str; 26] = [
    "drug_name",
    "canonical_id",
    "pref_name",
    "max_phase",
    "first_approval",
    "molecule_type",
    "therapeutic_flag",
    "oral",
    "parenteral",
    "topical",
    "structure_type",
    "full_mwt",
    "alogp",
    "cx_logp",
    "hba",
    "hbd",
    "psa",
    "rtb",
    "full_molformula",
    "canonical_smiles",
    "standard_inchi",
    "standard_inchi_key",
    "activities_count",
    "mechanisms_count",
    "has_drug_record",
    "error",
];

/// Fixed-schema projection of an [`EnrichmentRecord`]. Field order matches
/// [`FLAT_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRow {
    pub drug_name: String,
    pub canonical_id: Option<String>,
    pub pref_name: Option<String>,
    pub max_phase: Option<String>,
    pub first_approval: Option<String>,
    pub molecule_type: Option<String>,
    pub therapeutic_flag: Option<String>,
    pub oral: Option<String>,
    pub parenteral: Option<String>,
    pub topical: Option<String>,
    pub structure_type: Option<String>,
    pub full_mwt: Option<String>,
    pub alogp: Option<String>,
    pub cx_logp: Option<String>,
    pub hba: Option<String>,
    pub hbd: Option<String>,
    pub psa: Option<String>,
    pub rtb: Option<String>,
    pub full_molformula: Option<String>,
    pub canonical_smiles: Option<String>,
    pub standard_inchi: Option<String>,
    pub standard_inchi_key: Option<String>,
    pub activities_count: u64,
    pub mechanisms_count: u64,
    pub has_drug_record: bool,
    pub error: Option<String>,
}

impl FlatRow {
    /// Cell text in column order; absent values become empty cells.
    pub fn values(&self) -> [String; 26] {
        let cell = |v: &Option<String>| v.clone().unwrap_or_default();
        [
            self.drug_name.clone(),
            cell(&self.canonical_id),
            cell(&self.pref_name),
            cell(&self.max_phase),
            cell(&self.first_approval),
            cell(&self.molecule_type),
            cell(&self.therapeutic_flag),
            cell(&self.oral),
            cell(&self.parenteral),
            cell(&self.topical),
            cell(&self.structure_type),
            cell(&self.full_mwt),
            cell(&self.alogp),
            cell(&self.cx_logp),
            cell(&self.hba),
            cell(&self.hbd),
            cell(&self.psa),
            cell(&self.rtb),
            cell(&self.full_molformula),
            cell(&self.canonical_smiles),
            cell(&self.standard_inchi),
            cell(&self.standard_inchi_key),
            self.activities_count.to_string(),
            self.mechanisms_count.to_string(),
            self.has_drug_record.to_string(),
            cell(&self.error),
        ]
    }
}

fn scalar_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn nested<'a>(detail: &'a Payload, key: &str) -> Option<&'a JsonMap> {
    detail.get(key).and_then(JsonValue::as_object)
}

pub fn flatten_record(record: &EnrichmentRecord) -> FlatRow {
    let detail = &record.detail;
    let props = nested(detail, "molecule_properties");
    let structs = nested(detail, "molecule_structures");
    let top = |key: &str| scalar_text(detail.get(key));
    let prop = |key: &str| scalar_text(props.and_then(|m| m.get(key)));
    let structure = |key: &str| scalar_text(structs.and_then(|m| m.get(key)));

    FlatRow {
        drug_name: record.raw_name.clone(),
        canonical_id: record.canonical_id.clone(),
        pref_name: top("pref_name"),
        max_phase: top("max_phase"),
        first_approval: top("first_approval"),
        molecule_type: top("molecule_type"),
        therapeutic_flag: top("therapeutic_flag"),
        oral: top("oral"),
        parenteral: top("parenteral"),
        topical: top("topical"),
        structure_type: top("structure_type"),
        full_mwt: prop("full_mwt"),
        alogp: prop("alogp"),
        cx_logp: prop("cx_logp"),
        hba: prop("hba"),
        hbd: prop("hbd"),
        psa: prop("psa"),
        rtb: prop("rtb"),
        full_molformula: prop("full_molformula"),
        canonical_smiles: structure("canonical_smiles"),
        standard_inchi: structure("standard_inchi"),
        standard_inchi_key: structure("standard_inchi_key"),
        activities_count: record.activities.len() as u64,
        mechanisms_count: record.mechanisms.len() as u64,
        has_drug_record: record
            .relation
            .as_structured()
            .is_some_and(|map| !map.is_empty()),
        error: record.error().map(|e| e.kind.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structured(value: JsonValue) -> Payload {
        match value {
            JsonValue::Object(map) => Payload::Structured(map),
            other => panic!("expected object, got {other}"),
        }
    }

    fn sample_record() -> EnrichmentRecord {
        EnrichmentRecord {
            raw_name: "Aspirin".into(),
            canonical_id: Some("CHEMBL25".into()),
            detail: structured(json!({
                "pref_name": "ASPIRIN",
                "max_phase": "4.0",
                "first_approval": 1950,
                "oral": true,
                "molecule_properties": {"full_mwt": "180.16", "hba": 3, "alogp": null},
                "molecule_structures": {"canonical_smiles": "CC(=O)Oc1ccccc1C(=O)O"}
            })),
            relation: structured(json!({"development_phase": 4})),
            activities: vec![JsonMap::new(), JsonMap::new()],
            mechanisms: vec![JsonMap::new()],
            asset: None,
            errors: Vec::new(),
        }
    }

    #[test]
    fn normalization_strips_separators_and_folds_case() {
        assert_eq!(
            normalize_name(" Acetyl-salicylic_acid, 5.0 ", NameCase::Lower),
            "acetylsalicylicacid50"
        );
        assert_eq!(normalize_name("co-trimoxazole/DS;x:y", NameCase::Upper), "COTRIMOXAZOLEDSXY");
        assert_eq!(normalize_name("\t\n", NameCase::Lower), "");
        assert_eq!(normalize_name("(+)-Ibuprofen", NameCase::Lower), "(+)ibuprofen");
    }

    #[test]
    fn non_string_json_names_normalize_to_empty() {
        assert_eq!(normalize_json_name(&json!(null), NameCase::Lower), "");
        assert_eq!(normalize_json_name(&json!(42), NameCase::Upper), "");
        assert_eq!(normalize_json_name(&json!("Para-cetamol"), NameCase::Lower), "paracetamol");
    }

    #[test]
    fn target_names_match_on_uppercase_key() {
        let targets: TargetNames = ["Metformin HCl", "  ", "losartan-potassium"]
            .into_iter()
            .collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains("METFORMIN hcl"));
        assert!(targets.contains("Losartan Potassium"));
        assert!(!targets.contains("metformin"));
        assert!(!targets.contains(""));
    }

    #[test]
    fn flatten_projects_nested_scalars() {
        let row = flatten_record(&sample_record());
        assert_eq!(row.pref_name.as_deref(), Some("ASPIRIN"));
        assert_eq!(row.first_approval.as_deref(), Some("1950"));
        assert_eq!(row.oral.as_deref(), Some("true"));
        assert_eq!(row.full_mwt.as_deref(), Some("180.16"));
        assert_eq!(row.hba.as_deref(), Some("3"));
        assert_eq!(row.alogp, None);
        assert_eq!(row.standard_inchi_key, None);
        assert_eq!(row.activities_count, 2);
        assert_eq!(row.mechanisms_count, 1);
        assert!(row.has_drug_record);
        assert_eq!(row.error, None);
    }

    #[test]
    fn flatten_is_deterministic() {
        let record = sample_record();
        let first = flatten_record(&record).values().join(",");
        let second = flatten_record(&record.clone()).values().join(",");
        assert_eq!(first, second);
    }

    #[test]
    fn flatten_tolerates_unresolved_and_raw_text() {
        let record = EnrichmentRecord::unresolved(
            "Unobtainium",
            RecordError::new(ErrorKind::NotFound, Stage::Resolve, "no candidates"),
        );
        let row = flatten_record(&record);
        assert_eq!(row.canonical_id, None);
        assert_eq!(row.activities_count, 0);
        assert!(!row.has_drug_record);
        assert_eq!(row.error.as_deref(), Some("not_found"));
        assert_eq!(row.values().len(), FLAT_COLUMNS.len());

        let raw = EnrichmentRecord {
            raw_name: "x".into(),
            detail: Payload::RawText("<html>".into()),
            relation: Payload::Structured(JsonMap::new()),
            ..Default::default()
        };
        let row = flatten_record(&raw);
        assert_eq!(row.pref_name, None);
        assert!(!row.has_drug_record);
    }

    #[test]
    fn payload_serializes_as_tagged_variant() {
        let text = serde_json::to_value(Payload::RawText("oops".into())).unwrap();
        assert_eq!(text, json!({"kind": "raw_text", "value": "oops"}));
        let absent = serde_json::to_value(Payload::Absent).unwrap();
        assert_eq!(absent, json!({"kind": "absent"}));
    }

    #[test]
    fn asset_bytes_stay_out_of_serialized_record() {
        let asset = Asset::new("image/svg+xml", b"<svg/>".to_vec());
        let value = serde_json::to_value(&asset).unwrap();
        assert_eq!(value, json!({"content_type": "image/svg+xml", "byte_len": 6}));
    }
}
