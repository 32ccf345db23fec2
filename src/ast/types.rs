//! Typed descriptors handed to the T-SQL compiler.
//!
//! The host ORM builds these incrementally; the compiler only reads them.
//! Every descriptor derives serde so it can also be written as TOML/JSON
//! (the CLI compiles descriptor files directly).
use serde::{Deserialize, Deserializer, Serialize};

/// A bound parameter or DDL default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Row limit of a select.
///
/// `Count` renders as a leading `top N`; `Range` switches the compiler into
/// row-numbered pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Limit {
    Count(u64),
    Range { offset: u64, count: u64 },
}

/// One logical select statement.
///
/// Clause fields hold pre-rendered SQL fragments (the host ORM has already
/// quoted identifiers and emitted `?` placeholders for `bindings`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectQuery {
    pub table: String,
    /// Pre-joined select list. Empty means `*`.
    pub selects: String,
    pub distinct: bool,
    /// Full from-target when present; replaces the bare table name.
    pub join: String,
    #[serde(rename = "where")]
    pub where_clause: String,
    pub order_by: String,
    pub group_by: String,
    pub having: String,
    pub union: String,
    pub limit: Option<Limit>,
    /// Positional values for the `?` placeholders, in order of appearance.
    pub bindings: Vec<Value>,
    /// Column used to number rows when paginating without an explicit order.
    pub row_order_column: Option<String>,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn select(mut self, selects: impl Into<String>) -> Self {
        self.selects = selects.into();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.join = join.into();
        self
    }

    /// Set the where predicate. Placeholders are matched with [`SelectQuery::bind`].
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.where_clause = predicate.into();
        self
    }

    pub fn order(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = order_by.into();
        self
    }

    pub fn group(mut self, group_by: impl Into<String>) -> Self {
        self.group_by = group_by.into();
        self
    }

    pub fn having(mut self, having: impl Into<String>) -> Self {
        self.having = having.into();
        self
    }

    pub fn union(mut self, union: impl Into<String>) -> Self {
        self.union = union.into();
        self
    }

    pub fn bind<T: Into<Value>>(mut self, value: T) -> Self {
        self.bindings.push(value.into());
        self
    }
}

/// Column length: `(255)` or `(10,2)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Length {
    Scalar(u32),
    List(Vec<u32>),
}

/// Identity seed and step for an auto-increment primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub seed: i64,
    #[serde(default = "Identity::default_step")]
    pub step: i64,
}

impl Identity {
    pub fn new(seed: i64) -> Self {
        Self { seed, step: 1 }
    }

    fn default_step() -> i64 {
        1
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub field: String,
    #[serde(default = "ForeignKey::default_action")]
    pub on_delete: String,
    #[serde(default = "ForeignKey::default_action")]
    pub on_update: String,
}

impl ForeignKey {
    fn default_action() -> String {
        "no action".to_string()
    }
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type", default = "FieldDef::default_type")]
    pub type_name: String,
    #[serde(default)]
    pub length: Option<Length>,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub unsigned: bool,
    #[serde(default)]
    pub primary: bool,
    /// `None` emits nothing; `Some(Value::Null)` emits `default null`.
    #[serde(
        default,
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub auto_increment: Option<Identity>,
    #[serde(default)]
    pub foreign_key: Option<ForeignKey>,
}

impl FieldDef {
    /// A column of type `int` with no modifiers.
    pub fn new(name: impl Into<String>) -> Self {
        Self::typed(name, Self::default_type())
    }

    pub fn typed(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            length: None,
            not_null: false,
            unique: false,
            unsigned: false,
            primary: false,
            default: None,
            comment: None,
            auto_increment: None,
            foreign_key: None,
        }
    }

    fn default_type() -> String {
        "int".to_string()
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(Length::Scalar(length));
        self
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.length = Some(Length::List(vec![precision, scale]));
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn auto_increment(mut self, seed: i64) -> Self {
        self.auto_increment = Some(Identity::new(seed));
        self
    }

    pub fn identity(mut self, seed: i64, step: i64) -> Self {
        self.auto_increment = Some(Identity { seed, step });
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_value<T: Into<Value>>(mut self, value: T) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn references(
        mut self,
        table: impl Into<String>,
        field: impl Into<String>,
        on_delete: impl Into<String>,
        on_update: impl Into<String>,
    ) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            field: field.into(),
            on_delete: on_delete.into(),
            on_update: on_update.into(),
        });
        self
    }

    pub fn is_identity(&self) -> bool {
        self.primary && self.auto_increment.is_some()
    }
}

/// A present `null` is `Some(Value::Null)`; only a missing field is `None`.
fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A table definition with columns in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a column, replacing an existing one with the same name in place.
    pub fn add_column(&mut self, field: FieldDef) -> &mut Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    pub fn column(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}
