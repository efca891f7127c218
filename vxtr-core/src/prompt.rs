use crate::error::AttemptFailure;
use crate::gateway::ImageSource;
use crate::gateway::Message;
use crate::schema::FieldSpec;
use crate::schema::FieldType;
use crate::schema::Schema;
use crate::schema::TaskKind;

/// Render the gateway message for one attempt.
///
/// Pure and deterministic: the same inputs always produce the same message.
/// A repair hint never rewrites the instruction, it is appended as the final
/// paragraph.
pub fn build(
    kind: TaskKind,
    schema: &Schema,
    image: ImageSource,
    note: Option<&str>,
    repair_hint: Option<&str>,
) -> Message {
    Message {
        system: system_line(schema),
        instruction: instruction_body(kind, schema, note, repair_hint),
        images: vec![image],
    }
}

/// Corrective paragraph for the retry after a failed attempt.
pub fn repair_hint(failure: &AttemptFailure) -> String {
    match failure {
        AttemptFailure::Malformed { reason, .. } => format!(
            "Previous attempt failed: the response was not a parseable JSON object ({reason}). \
             Return only the JSON object, with no surrounding text."
        ),
        AttemptFailure::SchemaViolation {
            field,
            expected,
            found,
        } => format!(
            "Previous attempt failed validation: field \"{field}\" expected {expected} but got \
             \"{found}\". Correct that field and return the complete JSON object again."
        ),
        AttemptFailure::Gateway(err) => {
            format!("Previous attempt did not complete: {err}. Answer again from scratch.")
        }
    }
}

fn system_line(schema: &Schema) -> String {
    let keys = schema
        .fields()
        .iter()
        .map(|field| field.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are an information extraction assistant. Look at the supplied image and return ONLY \
         a single compact JSON object with the keys: {keys}. Do not include markdown, code \
         fences, or commentary."
    )
}

fn instruction_body(
    kind: TaskKind,
    schema: &Schema,
    note: Option<&str>,
    repair_hint: Option<&str>,
) -> String {
    let mut sections = vec![task_instruction(kind).to_string()];

    let mut lines = vec!["Fields:".to_string()];
    for field in schema.fields() {
        lines.push(field_line(field));
    }
    sections.push(lines.join("\n"));

    if let Some(note) = note
        && !note.trim().is_empty()
    {
        sections.push(note.trim().to_string());
    }

    if let Some(hint) = repair_hint {
        sections.push(hint.to_string());
    }

    sections.join("\n\n")
}

fn task_instruction(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::ProfileExtraction => "Extract the account profile shown in the image.",
        TaskKind::ReceiptExtraction => "Extract the receipt shown in the image.",
        TaskKind::AgeClassification => {
            "Classify the age group of the person shown in the image."
        }
        TaskKind::Description => "Describe what the image shows.",
        TaskKind::StatementExtraction => {
            "Extract the account statement summary shown in the image."
        }
    }
}

fn field_line(field: &FieldSpec) -> String {
    let constraint = match &field.field_type {
        FieldType::Integer => {
            "integer as plain digits (no commas, currency signs, or abbreviations)".to_string()
        }
        FieldType::Float => {
            "number with a dot as the decimal separator (no currency signs or thousands \
             separators)"
                .to_string()
        }
        FieldType::String => "text".to_string(),
        FieldType::Enum(values) => format!("exactly one of: {}", values.join(", ")),
        FieldType::Date(format) => format!("date written as {format}"),
    };

    format!(
        "- {}: {constraint}; use \"{}\" if not visible",
        field.name, field.missing_sentinel
    )
}
