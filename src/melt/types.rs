use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::melt::detect;

/// Enumerated labels of a leaf: raw value -> display label
pub type Labels = BTreeMap<String, String>;

/// The observed type of a leaf value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    /// The path has been seen with conflicting types
    Mixed,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::String,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Null | Value::Array(_) | Value::Object(_) => ValueType::Mixed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Mixed => "mixed",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presentation role of a leaf, derived from its type and writability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Indicator,
    Switch,
    Value,
    Level,
    Text,
    State,
}

impl Role {
    pub fn derive(value_type: ValueType, writable: bool) -> Self {
        match (value_type, writable) {
            (ValueType::Boolean, false) => Role::Indicator,
            (ValueType::Boolean, true) => Role::Switch,
            (ValueType::Number, false) => Role::Value,
            (ValueType::Number, true) => Role::Level,
            (ValueType::String, _) => Role::Text,
            (ValueType::Mixed, _) => Role::State,
        }
    }
}

/// Metadata attached to a leaf path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub role: Role,
    pub value_type: ValueType,
    pub writable: bool,
    pub readable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, value_type: ValueType, writable: bool) -> Self {
        NodeDescriptor {
            name: name.into(),
            role: Role::derive(value_type, writable),
            value_type,
            writable,
            readable: true,
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// A node in the state tree: either a container grouping children or a leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeNode {
    Container { name: String },
    Leaf(NodeDescriptor),
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::Container { name } => name,
            TreeNode::Leaf(descriptor) => &descriptor.name,
        }
    }

    pub fn as_leaf(&self) -> Option<&NodeDescriptor> {
        match self {
            TreeNode::Leaf(descriptor) => Some(descriptor),
            TreeNode::Container { .. } => None,
        }
    }
}

/// Options for a walk. Field names deserialize from the camelCase option
/// object used by existing callers, e.g. `{"preferedArrayName": "vin"}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WalkOptions {
    /// Leaves are created writable
    pub write: bool,

    /// Always name array elements by their index
    pub force_index: bool,

    /// Display name of the container created at the walk root
    pub channel_name: Option<String>,

    /// Field (`a`), nested field (`a/b`) or compound (`a+b`, `a+b/c`) naming array elements
    pub prefered_array_name: Option<String>,

    /// Field whose value names the container of an array element
    pub prefered_array_desc: Option<String>,

    /// Parse string values that are themselves JSON
    pub auto_cast: bool,

    /// Display name overrides per key
    pub descriptions: HashMap<String, String>,

    /// Enumerated label seeds per path or key
    pub states: HashMap<String, Labels>,

    /// Decode every base64-shaped string
    pub parse_base64: bool,

    /// Paths or keys whose values are always base64 decoded
    #[serde(rename = "parseBase64byIds")]
    pub parse_base64_by_ids: Vec<String>,

    /// Purge the subtree before recreating the root container
    pub delete_before_update: bool,

    /// Drop anything whose path mentions a password
    pub remove_passwords: bool,
}

impl WalkOptions {
    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn with_force_index(mut self, force_index: bool) -> Self {
        self.force_index = force_index;
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self
    }

    pub fn with_prefered_array_name(mut self, expr: impl Into<String>) -> Self {
        self.prefered_array_name = Some(expr.into());
        self
    }

    pub fn with_auto_cast(mut self, auto_cast: bool) -> Self {
        self.auto_cast = auto_cast;
        self
    }

    pub fn with_parse_base64(mut self, parse_base64: bool) -> Self {
        self.parse_base64 = parse_base64;
        self
    }

    pub fn with_delete_before_update(mut self, delete: bool) -> Self {
        self.delete_before_update = delete;
        self
    }

    pub fn with_remove_passwords(mut self, remove: bool) -> Self {
        self.remove_passwords = remove;
        self
    }

    /// Display name for a key, honoring `descriptions`
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.descriptions.get(key).map_or(key, String::as_str)
    }

    /// Label seed for a leaf, looked up by full path first, then by key
    pub fn label_seed(&self, path: &str, key: &str) -> Option<&Labels> {
        self.states.get(path).or_else(|| self.states.get(key))
    }

    /// Whether `value` at `id` (a path or a key) should be base64 decoded
    pub fn decodes_base64(&self, id: &str, value: &Value) -> bool {
        (self.parse_base64 && detect::is_base64(value))
            || (value.is_string() && self.parse_base64_by_ids.iter().any(|known| known == id))
    }

    /// Options for the levels below a freshly handled container: the
    /// one-shot `channel_name` and `delete_before_update` no longer apply.
    pub fn for_children(&self) -> Self {
        WalkOptions {
            channel_name: None,
            delete_before_update: false,
            ..self.clone()
        }
    }
}
