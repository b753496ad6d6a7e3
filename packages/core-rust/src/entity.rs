//! Entity descriptors for the two storage granularities.
//!
//! A [`DatasetInfo`] or [`DatafileInfo`] identifies one unit of data the
//! gateway moves between main and archive storage. Identity is the numeric
//! id (within the concrete variant); ids are immutable after construction
//! and equality/hashing consider nothing else, so descriptors built from
//! separate catalog lookups compare equal whenever they denote the same
//! entity.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage granularity the gateway is configured for.
///
/// Two-level deployments move either whole datasets or individual datafiles
/// between main and archive storage; the deferred-operation queue only ever
/// holds entities of the configured granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageUnit {
    Dataset,
    Datafile,
}

impl fmt::Display for StorageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUnit::Dataset => write!(f, "dataset"),
            StorageUnit::Datafile => write!(f, "datafile"),
        }
    }
}

impl FromStr for StorageUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dataset" => Ok(StorageUnit::Dataset),
            "datafile" => Ok(StorageUnit::Datafile),
            other => Err(format!("unknown storage unit: {other}")),
        }
    }
}

/// Descriptor for a dataset.
///
/// Carries the catalog context (facility, investigation, visit) needed to
/// derive storage paths and log lines. Identity is `id` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub id: i64,
    pub name: String,
    /// Storage location of the dataset, relative to the storage root.
    pub location: String,
    pub facility_id: i64,
    pub facility_name: String,
    pub investigation_id: i64,
    pub investigation_name: String,
    pub visit_id: String,
}

impl PartialEq for DatasetInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DatasetInfo {}

impl Hash for DatasetInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.facility_name, self.investigation_name, self.visit_id, self.name
        )
    }
}

/// Descriptor for a datafile.
///
/// `create_id`/`mod_id` are opaque provenance strings handed through to the
/// main storage on get/delete. Identity is `id` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatafileInfo {
    pub id: i64,
    pub name: String,
    /// Storage location of the file, relative to the storage root.
    pub location: String,
    pub create_id: String,
    pub mod_id: String,
    /// Id of the dataset this file belongs to.
    pub dataset_id: i64,
}

impl PartialEq for DatafileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DatafileInfo {}

impl Hash for DatafileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DatafileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// A dataset or datafile descriptor, as held in the deferred-operation
/// queue.
///
/// Equality and hashing delegate to the variant's id, so two `DataInfo`s
/// are equal iff they are the same concrete kind and carry the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataInfo {
    Dataset(DatasetInfo),
    Datafile(DatafileInfo),
}

impl DataInfo {
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            DataInfo::Dataset(ds) => ds.id,
            DataInfo::Datafile(df) => df.id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            DataInfo::Dataset(ds) => &ds.name,
            DataInfo::Datafile(df) => &df.name,
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            DataInfo::Dataset(ds) => &ds.location,
            DataInfo::Datafile(df) => &df.location,
        }
    }

    /// Granularity this descriptor belongs to.
    #[must_use]
    pub fn storage_unit(&self) -> StorageUnit {
        match self {
            DataInfo::Dataset(_) => StorageUnit::Dataset,
            DataInfo::Datafile(_) => StorageUnit::Datafile,
        }
    }

    #[must_use]
    pub fn as_dataset(&self) -> Option<&DatasetInfo> {
        match self {
            DataInfo::Dataset(ds) => Some(ds),
            DataInfo::Datafile(_) => None,
        }
    }

    #[must_use]
    pub fn as_datafile(&self) -> Option<&DatafileInfo> {
        match self {
            DataInfo::Datafile(df) => Some(df),
            DataInfo::Dataset(_) => None,
        }
    }
}

impl fmt::Display for DataInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataInfo::Dataset(ds) => ds.fmt(f),
            DataInfo::Datafile(df) => df.fmt(f),
        }
    }
}

impl From<DatasetInfo> for DataInfo {
    fn from(ds: DatasetInfo) -> Self {
        DataInfo::Dataset(ds)
    }
}

impl From<DatafileInfo> for DataInfo {
    fn from(df: DatafileInfo) -> Self {
        DataInfo::Datafile(df)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn dataset(id: i64, name: &str) -> DatasetInfo {
        DatasetInfo {
            id,
            name: name.to_string(),
            location: format!("inv/{name}"),
            facility_id: 1,
            facility_name: "facility".to_string(),
            investigation_id: 10,
            investigation_name: "inv".to_string(),
            visit_id: "v1".to_string(),
        }
    }

    fn datafile(id: i64, dataset_id: i64) -> DatafileInfo {
        DatafileInfo {
            id,
            name: format!("file-{id}"),
            location: format!("inv/ds/file-{id}"),
            create_id: "creator".to_string(),
            mod_id: "modifier".to_string(),
            dataset_id,
        }
    }

    #[test]
    fn dataset_identity_is_id_only() {
        let a = dataset(7, "alpha");
        let mut b = dataset(7, "beta");
        b.location = "elsewhere".to_string();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn variants_with_same_id_are_distinct() {
        let ds: DataInfo = dataset(3, "ds").into();
        let df: DataInfo = datafile(3, 1).into();
        assert_ne!(ds, df);

        let mut set = HashSet::new();
        set.insert(ds);
        set.insert(df);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn storage_unit_round_trips_from_str() {
        assert_eq!("dataset".parse::<StorageUnit>().unwrap(), StorageUnit::Dataset);
        assert_eq!("Datafile".parse::<StorageUnit>().unwrap(), StorageUnit::Datafile);
        assert!("blob".parse::<StorageUnit>().is_err());
    }

    proptest::proptest! {
        /// Equality ignores every field except the id, whatever the other
        /// fields hold.
        #[test]
        fn datafile_equality_tracks_id(
            id in proptest::num::i64::ANY,
            name in "[a-z]{1,12}",
            other_name in "[a-z]{1,12}",
            ds_a in 0i64..1000,
            ds_b in 0i64..1000,
        ) {
            let mut a = datafile(id, ds_a);
            a.name = name;
            let mut b = datafile(id, ds_b);
            b.name = other_name;
            proptest::prop_assert_eq!(&a, &b);

            let mut set = HashSet::new();
            set.insert(a);
            proptest::prop_assert!(set.contains(&b));
        }
    }
}
