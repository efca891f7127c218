use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ExtractError;

/// Sentinel rendered for fields the model could not read, unless a field
/// overrides it.
pub const DEFAULT_MISSING_SENTINEL: &str = "na";

/// Date layout used when an override declares a date field without a format.
pub const DEFAULT_DATE_FORMAT: &str = "DD/MM/YYYY";

/// The task families the service knows how to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Social account profile: handle plus follower statistics.
    ProfileExtraction,
    /// Printed receipt: venue, date, total.
    ReceiptExtraction,
    /// Age-group classification of a pictured person.
    AgeClassification,
    /// Free-form description of the image.
    Description,
    /// Account statement summary: balances and activity.
    StatementExtraction,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::ProfileExtraction,
        TaskKind::ReceiptExtraction,
        TaskKind::AgeClassification,
        TaskKind::Description,
        TaskKind::StatementExtraction,
    ];

    /// Stable name used on the CLI and in `[schemas.<name>]` config tables.
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::ProfileExtraction => "profile",
            TaskKind::ReceiptExtraction => "receipt",
            TaskKind::AgeClassification => "age",
            TaskKind::Description => "describe",
            TaskKind::StatementExtraction => "statement",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = ExtractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let folded = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == folded)
            .ok_or_else(|| ExtractError::UnknownTaskKind(value.trim().to_string()))
    }
}

/// Declared type of a schema field. Drives both the prompt wording and the
/// validation rules for that field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    String,
    /// Closed set of accepted labels; matching folds case and whitespace.
    Enum(Vec<String>),
    /// Fixed textual layout such as "DD/MM/YYYY". Letters stand for digits,
    /// everything else is a literal. Only the shape is checked, never
    /// calendar validity.
    Date(String),
}

impl FieldType {
    /// Wording used in prompts and in violation reports.
    pub fn describe(&self) -> String {
        match self {
            FieldType::Integer => "integer".to_string(),
            FieldType::Float => "number".to_string(),
            FieldType::String => "text".to_string(),
            FieldType::Enum(values) => format!("one of: {}", values.join(", ")),
            FieldType::Date(format) => format!("date formatted {format}"),
        }
    }
}

/// One field of a task schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub missing_sentinel: String,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            missing_sentinel: DEFAULT_MISSING_SENTINEL.to_string(),
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.missing_sentinel = sentinel.into();
        self
    }
}

/// Ordered field list for one task kind. Declaration order is both the
/// validation order and the output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Immutable mapping from task kind to schema, seeded with the built-in
/// tasks and optionally overridden from configuration.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entries: HashMap<TaskKind, Schema>,
}

impl SchemaRegistry {
    /// Registry holding exactly the built-in task schemas.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(TaskKind::ProfileExtraction, profile_schema());
        entries.insert(TaskKind::ReceiptExtraction, receipt_schema());
        entries.insert(TaskKind::AgeClassification, age_schema());
        entries.insert(TaskKind::Description, describe_schema());
        entries.insert(TaskKind::StatementExtraction, statement_schema());
        Self { entries }
    }

    /// Build a registry from explicit entries, checking every schema.
    pub fn new(entries: HashMap<TaskKind, Schema>) -> Result<Self, ExtractError> {
        for (kind, schema) in &entries {
            validate_schema(*kind, schema)?;
        }
        Ok(Self { entries })
    }

    /// Built-in schemas with `[schemas.<kind>]` overrides applied on top.
    /// An override replaces the whole field list for its kind.
    pub fn with_overrides(
        overrides: &HashMap<String, SchemaOverride>,
    ) -> Result<Self, ExtractError> {
        let mut registry = Self::builtin();
        for (name, spec) in overrides {
            let kind = name.parse::<TaskKind>()?;
            let schema = spec.to_schema(kind)?;
            validate_schema(kind, &schema)?;
            registry.entries.insert(kind, schema);
        }
        Ok(registry)
    }

    pub fn get(&self, kind: TaskKind) -> Result<&Schema, ExtractError> {
        self.entries
            .get(&kind)
            .ok_or_else(|| ExtractError::UnknownTaskKind(kind.name().to_string()))
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.entries.contains_key(kind))
            .collect()
    }
}

fn profile_schema() -> Schema {
    Schema::new(vec![
        FieldSpec::required("user_name", FieldType::String),
        FieldSpec::optional("follower_count", FieldType::Integer),
        FieldSpec::optional("following_count", FieldType::Integer),
        FieldSpec::optional("posts_count", FieldType::Integer),
        FieldSpec::optional("summary", FieldType::String),
    ])
}

fn receipt_schema() -> Schema {
    Schema::new(vec![
        FieldSpec::required("place_name", FieldType::String),
        FieldSpec::required("date", FieldType::Date(DEFAULT_DATE_FORMAT.to_string())),
        FieldSpec::required("total", FieldType::Float),
    ])
}

fn age_schema() -> Schema {
    Schema::new(vec![FieldSpec::required(
        "category",
        FieldType::Enum(vec![
            "child".to_string(),
            "teenager".to_string(),
            "young adult".to_string(),
            "adult".to_string(),
            "senior".to_string(),
        ]),
    )])
}

fn describe_schema() -> Schema {
    Schema::new(vec![FieldSpec::required("description", FieldType::String)])
}

fn statement_schema() -> Schema {
    Schema::new(vec![
        FieldSpec::required("account_name", FieldType::String),
        FieldSpec::optional("period", FieldType::String),
        FieldSpec::optional("opening_balance", FieldType::Float),
        FieldSpec::required("closing_balance", FieldType::Float),
        FieldSpec::optional("transaction_count", FieldType::Integer),
    ])
}

fn validate_schema(kind: TaskKind, schema: &Schema) -> Result<(), ExtractError> {
    let invalid = |reason: String| ExtractError::InvalidSchema {
        task: kind.name().to_string(),
        reason,
    };

    if schema.fields.is_empty() {
        return Err(invalid("schema has no fields".to_string()));
    }

    let mut seen = HashSet::new();
    for field in &schema.fields {
        if field.name.trim().is_empty() {
            return Err(invalid("field with an empty name".to_string()));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(invalid(format!("duplicate field '{}'", field.name)));
        }
        if field.missing_sentinel.is_empty() {
            return Err(invalid(format!(
                "field '{}' has an empty missing sentinel",
                field.name
            )));
        }
        match &field.field_type {
            FieldType::Enum(values) => {
                if values.is_empty() || values.iter().any(|value| value.trim().is_empty()) {
                    return Err(invalid(format!(
                        "field '{}' needs at least one non-empty enum value",
                        field.name
                    )));
                }
            }
            FieldType::Date(format) => {
                if !format.chars().any(|ch| ch.is_ascii_alphabetic()) {
                    return Err(invalid(format!(
                        "field '{}' has a date format without digit positions",
                        field.name
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Replacement field list for one task, parsed from a `[schemas.<kind>]`
/// config table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaOverride {
    pub fields: Vec<FieldOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldOverride {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    /// Accepted labels, for `type = "enum"` fields.
    #[serde(default)]
    pub values: Vec<String>,
    /// Layout pattern, for `type = "date"` fields.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

fn default_required() -> bool {
    true
}

fn default_sentinel() -> String {
    DEFAULT_MISSING_SENTINEL.to_string()
}

impl SchemaOverride {
    pub fn to_schema(&self, kind: TaskKind) -> Result<Schema, ExtractError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            fields.push(field.to_spec(kind)?);
        }
        Ok(Schema::new(fields))
    }
}

impl FieldOverride {
    fn to_spec(&self, kind: TaskKind) -> Result<FieldSpec, ExtractError> {
        let field_type = match self.field_type.to_ascii_lowercase().as_str() {
            "integer" | "int" => FieldType::Integer,
            "float" | "number" => FieldType::Float,
            "string" | "text" => FieldType::String,
            "enum" => FieldType::Enum(self.values.clone()),
            "date" => FieldType::Date(
                self.format
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
            ),
            other => {
                return Err(ExtractError::InvalidSchema {
                    task: kind.name().to_string(),
                    reason: format!("field '{}' has unsupported type '{other}'", self.name),
                });
            }
        };

        Ok(FieldSpec {
            name: self.name.clone(),
            field_type,
            required: self.required,
            missing_sentinel: self.sentinel.clone(),
        })
    }
}
