//! Core data model: dataset types, references, data coordinates and
//! dimension records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::timespan::Timespan;

/// A single value in a data coordinate or record field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Int(i64),
    Str(String),
}

impl DataValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DataValue::Int(v) => Some(*v),
            DataValue::Str(_) => None,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Int(v) => write!(f, "{v}"),
            DataValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Str(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Str(v)
    }
}

/// Dimension name to value mapping identifying a dataset.
pub type DataCoordinate = BTreeMap<String, DataValue>;

/// A named kind of dataset and the dimensions that identify its instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetType {
    pub name: String,
    pub dimensions: BTreeSet<String>,
}

impl DatasetType {
    pub fn new<I, S>(name: impl Into<String>, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_dimension(&self, dimension: &str) -> bool {
        self.dimensions.contains(dimension)
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self.dimensions.iter().map(String::as_str).collect();
        write!(f, "{}({})", self.name, dims.join(", "))
    }
}

/// Logical identity of one dataset instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub id: Uuid,
    pub dataset_type: DatasetType,
    pub data_id: DataCoordinate,
    pub run: String,
}

impl DatasetRef {
    pub fn new(dataset_type: DatasetType, data_id: DataCoordinate, run: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_type,
            data_id,
            run: run.into(),
        }
    }

    /// Integer value of a dimension in this dataset's data coordinate.
    pub fn dimension_id(&self, dimension: &str) -> Option<i64> {
        self.data_id.get(dimension).and_then(DataValue::as_int)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coords: Vec<String> = self
            .data_id
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        write!(
            f,
            "{}@{{{}}} [{}] ({})",
            self.dataset_type.name,
            coords.join(", "),
            self.run,
            self.id
        )
    }
}

/// A concrete instance of a dimension element (exposure, visit, day_obs, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRecord {
    pub element: String,
    pub id: i64,
    pub instrument: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timespan: Option<Timespan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_obs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obs_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, DataValue>,
}

impl DimensionRecord {
    pub fn new(element: impl Into<String>, instrument: impl Into<String>, id: i64) -> Self {
        Self {
            element: element.into(),
            id,
            instrument: instrument.into(),
            timespan: None,
            day_obs: None,
            obs_id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_timespan(mut self, timespan: Timespan) -> Self {
        self.timespan = Some(timespan);
        self
    }

    pub fn with_observation(mut self, day_obs: i64, obs_id: impl Into<String>) -> Self {
        self.day_obs = Some(day_obs);
        self.obs_id = Some(obs_id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a named attribute, accepting both `name` and `element.name`.
    pub fn attribute(&self, name: &str) -> Option<DataValue> {
        let name = name
            .strip_prefix(self.element.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);
        match name {
            "id" => Some(DataValue::Int(self.id)),
            "instrument" => Some(DataValue::Str(self.instrument.clone())),
            "day_obs" => self.day_obs.map(DataValue::Int),
            "obs_id" => self.obs_id.clone().map(DataValue::Str),
            other if other == self.element => Some(DataValue::Int(self.id)),
            other => self.fields.get(other).cloned(),
        }
    }
}

/// Where a dataset's bytes live: a plain file, or a member of a zip archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

impl ArtifactLocation {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            member: None,
        }
    }

    pub fn zip_member(path: impl Into<PathBuf>, member: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            member: Some(member.into()),
        }
    }

    /// Directory containing the artifact (the archive's directory for members).
    pub fn dirname(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// File name the artifact takes when retrieved.
    pub fn file_name(&self) -> Option<String> {
        match &self.member {
            Some(member) => Some(member.clone()),
            None => self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(f, "{}#{}", self.path.display(), member),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// A file (or archive member) to ingest together with the datasets it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataset {
    pub location: ArtifactLocation,
    pub refs: Vec<DatasetRef>,
}

/// An artifact retrieved to local scratch space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedArtifact {
    pub dataset: DatasetRef,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_type() -> DatasetType {
        DatasetType::new("raw", ["instrument", "exposure", "detector"])
    }

    #[test]
    fn test_dataset_ref_json_line() {
        let mut data_id = DataCoordinate::new();
        data_id.insert("instrument".into(), "LATISS".into());
        data_id.insert("exposure".into(), 2020011700002.into());
        let dataset = DatasetRef::new(raw_type(), data_id, "LATISS/raw/all");
        let json = dataset.to_json().unwrap();
        assert!(!json.contains('\n'));
        assert_eq!(DatasetRef::from_json(&json).unwrap(), dataset);
        assert_eq!(dataset.dimension_id("exposure"), Some(2020011700002));
        assert_eq!(dataset.dimension_id("instrument"), None);
    }

    #[test]
    fn test_record_attribute_lookup() {
        let record = DimensionRecord::new("exposure", "LATISS", 42)
            .with_observation(20200117, "AT_O_20200117_000042")
            .with_field("observation_type", "science");
        assert_eq!(record.attribute("id"), Some(DataValue::Int(42)));
        assert_eq!(record.attribute("exposure.id"), Some(DataValue::Int(42)));
        assert_eq!(record.attribute("exposure"), Some(DataValue::Int(42)));
        assert_eq!(record.attribute("day_obs"), Some(DataValue::Int(20200117)));
        assert_eq!(
            record.attribute("exposure.observation_type"),
            Some(DataValue::Str("science".into()))
        );
        assert_eq!(record.attribute("visit.id"), None);
    }

    #[test]
    fn test_artifact_location_display_and_names() {
        let plain = ArtifactLocation::file("/data/raw/a.fits");
        assert_eq!(plain.to_string(), "/data/raw/a.fits");
        assert_eq!(plain.file_name().as_deref(), Some("a.fits"));

        let member = ArtifactLocation::zip_member("/data/LATISS/20200117/x.zip", "b.fits");
        assert_eq!(member.to_string(), "/data/LATISS/20200117/x.zip#b.fits");
        assert_eq!(member.file_name().as_deref(), Some("b.fits"));
        assert_eq!(member.dirname(), Some(Path::new("/data/LATISS/20200117")));
    }

    #[test]
    fn test_data_value_untagged() {
        let values: Vec<DataValue> = serde_json::from_str(r#"[1, "g"]"#).unwrap();
        assert_eq!(values, vec![DataValue::Int(1), DataValue::Str("g".into())]);
    }
}
