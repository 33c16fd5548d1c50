use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of client-assigned ids that have not reached the server yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Every dashboard collection the client keeps in sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Guests,
    Budget,
    Todos,
    Seating,
    Vendors,
    Registries,
    Expenses,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Guests,
        ResourceKind::Budget,
        ResourceKind::Todos,
        ResourceKind::Seating,
        ResourceKind::Vendors,
        ResourceKind::Registries,
        ResourceKind::Expenses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Guests => "guests",
            ResourceKind::Budget => "budget",
            ResourceKind::Todos => "todos",
            ResourceKind::Seating => "seating",
            ResourceKind::Vendors => "vendors",
            ResourceKind::Registries => "registries",
            ResourceKind::Expenses => "expenses",
        }
    }

    /// Key of the collection inside the user's local store.
    pub fn cache_key(&self) -> &'static str {
        match self {
            ResourceKind::Expenses => "vivahaSplitExpenses",
            other => other.as_str(),
        }
    }

    /// REST collection path relative to the API base, if the backend has one.
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Guests => Some("api/guests"),
            ResourceKind::Budget => Some("api/budget"),
            ResourceKind::Todos => Some("api/todos"),
            ResourceKind::Seating => Some("api/seating"),
            ResourceKind::Vendors => Some("api/vendors"),
            ResourceKind::Registries => Some("api/registries"),
            ResourceKind::Expenses => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown resource kind: {0}")]
pub struct ParseKindError(String);

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}

/// Dual identity carried by every record, plus the server version stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIds {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "updatedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecordIds {
    /// True if `key` is either the server id or the client id.
    pub fn matches(&self, key: &str) -> bool {
        self.server_id.as_deref() == Some(key) || self.id.as_deref() == Some(key)
    }

    /// Preferred identifier: the server id once assigned.
    pub fn key(&self) -> Option<&str> {
        self.server_id.as_deref().or(self.id.as_deref())
    }

    pub fn is_local_only(&self) -> bool {
        self.server_id.is_none()
    }
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

pub fn local_id(epoch_ms: i64) -> String {
    format!("{LOCAL_ID_PREFIX}{epoch_ms}")
}

/// A record type the sync layer can manage.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn ids(&self) -> &RecordIds;
    fn ids_mut(&mut self) -> &mut RecordIds;
}

macro_rules! resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn ids(&self) -> &RecordIds {
                &self.ids
            }

            fn ids_mut(&mut self) -> &mut RecordIds {
                &mut self.ids
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RsvpStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub rsvp_status: RsvpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meal_preference: Option<String>,
    #[serde(default)]
    pub plus_one: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCategory {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub name: String,
    #[serde(default)]
    pub estimated_amount: f64,
    #[serde(default)]
    pub actual_amount: f64,
    #[serde(default)]
    pub paid: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TableShape {
    #[default]
    Round,
    Rectangle,
    Square,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeatingTable {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub name: String,
    #[serde(default)]
    pub capacity: u32,
    /// Guest ids seated at this table.
    #[serde(default)]
    pub guests: Vec<String>,
    #[serde(default)]
    pub shape: TableShape,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VendorStatus {
    #[default]
    Researching,
    Contacted,
    Booked,
    Paid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vendor {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_person: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
    #[serde(default)]
    pub deposit_paid: f64,
    #[serde(default)]
    pub status: VendorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Registry provider, e.g. `zola` or `amazon`.
    #[serde(rename = "type", default)]
    pub provider: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub person_id: String,
    pub amount: f64,
    #[serde(default)]
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    #[serde(flatten)]
    pub ids: RecordIds,
    pub category_name: String,
    #[serde(default)]
    pub description: String,
    pub total_amount: f64,
    #[serde(default)]
    pub paid_by: String,
    #[serde(default)]
    pub splits: Vec<Split>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub settled: bool,
}

resource!(Guest, ResourceKind::Guests);
resource!(BudgetCategory, ResourceKind::Budget);
resource!(Todo, ResourceKind::Todos);
resource!(SeatingTable, ResourceKind::Seating);
resource!(Vendor, ResourceKind::Vendors);
resource!(Registry, ResourceKind::Registries);
resource!(Expense, ResourceKind::Expenses);

/// Apply a shallow JSON merge patch to a record. Identity fields in the patch
/// are ignored; the record keeps its own ids.
pub fn merge_patch<T: Resource>(record: &T, patch: &Value) -> Result<T, serde_json::Error> {
    let mut merged = serde_json::to_value(record)?;
    if let (Value::Object(target), Value::Object(fields)) = (&mut merged, patch) {
        for (name, value) in fields {
            if matches!(name.as_str(), "_id" | "id" | "updatedAt") {
                continue;
            }
            if value.is_null() {
                target.remove(name);
            } else {
                target.insert(name.clone(), value.clone());
            }
        }
    }
    let mut out: T = serde_json::from_value(merged)?;
    *out.ids_mut() = record.ids().clone();
    Ok(out)
}

/// JSON body sent to the backend: no server-owned fields, no local-only id.
pub fn wire_body<T: Resource>(record: &T) -> Result<Value, serde_json::Error> {
    let mut body = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut body {
        map.remove("_id");
        map.remove("updatedAt");
        if record.ids().id.as_deref().is_some_and(is_local_id) {
            map.remove("id");
        }
    }
    Ok(body)
}
