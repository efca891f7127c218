use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use vxtr_core::AttemptFailure;
use vxtr_core::ConfigBundle;
use vxtr_core::ExtractError;
use vxtr_core::ExtractionRequest;
use vxtr_core::ExtractionService;
use vxtr_core::FieldSpec;
use vxtr_core::FieldType;
use vxtr_core::ImageSource;
use vxtr_core::SchemaRegistry;
use vxtr_core::TaskKind;
use vxtr_core::schema::DEFAULT_MISSING_SENTINEL;

pub struct ExtractOptions {
    pub task: TaskKind,
    pub note: Option<String>,
    pub attempts: Option<u32>,
    pub pretty: bool,
    pub output: Option<PathBuf>,
    pub append: bool,
}

pub async fn handle_extract(
    bundle: &ConfigBundle,
    image_ref: &str,
    options: ExtractOptions,
) -> Result<i32> {
    let mut service = ExtractionService::from_config(bundle)?;
    if let Some(attempts) = options.attempts {
        service = service.with_max_attempts(attempts);
    }
    let image = resolve_image_ref(image_ref)?;

    let mut request =
        ExtractionRequest::new(options.task, image).with_cancellation(cancel_on_ctrl_c());
    if let Some(note) = options.note {
        request = request.with_note(note);
    }

    match service.extract(request).await {
        Ok(record) => {
            let json = record.to_json();
            let rendered = if options.pretty {
                serde_json::to_string_pretty(&json)?
            } else {
                json.to_string()
            };
            write_lines(&[rendered], options.output.as_deref(), options.append)?;
            Ok(0)
        }
        Err(err) => {
            eprintln!("vxtr: {err}");
            Ok(failure_exit_code(&err))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestLine {
    task: String,
    image: String,
    #[serde(default)]
    note: Option<String>,
}

pub async fn handle_batch(
    bundle: &ConfigBundle,
    manifest: &Path,
    output: Option<&Path>,
    append: bool,
) -> Result<i32> {
    let service = ExtractionService::from_config(bundle)?;
    let content = fs::read_to_string(manifest)
        .with_context(|| format!("failed to read manifest '{}'", manifest.display()))?;

    let (lines, failures, exit) = run_batch(&service, &content, cancel_on_ctrl_c()).await;
    if lines.is_empty() {
        eprintln!("vxtr: manifest '{}' has no entries", manifest.display());
        return Ok(0);
    }

    let total = lines.len();
    write_lines(&lines, output, append)?;
    if failures > 0 {
        eprintln!("vxtr: {failures} of {total} extractions failed");
    }
    Ok(exit)
}

fn prepare_line(number: usize, line: &str, token: &CancellationToken) -> Result<ExtractionRequest> {
    let entry: ManifestLine = serde_json::from_str(line)
        .with_context(|| format!("manifest line {number} is not a valid JSON object"))?;
    let kind: TaskKind = entry
        .task
        .parse()
        .with_context(|| format!("manifest line {number}"))?;
    let image =
        resolve_image_ref(&entry.image).with_context(|| format!("manifest line {number}"))?;

    let mut request = ExtractionRequest::new(kind, image).with_cancellation(token.clone());
    if let Some(note) = entry.note {
        request = request.with_note(note);
    }
    Ok(request)
}

/// Run every manifest line, one JSON output line per input line in input
/// order. A line that fails setup (bad JSON, unknown task, unreadable image)
/// becomes an `{"error": ...}` line and the rest of the batch still runs.
/// Returns the output lines, the failure count, and the exit code of the
/// first failed line.
async fn run_batch(
    service: &ExtractionService,
    manifest: &str,
    token: CancellationToken,
) -> (Vec<String>, usize, i32) {
    let mut lines = Vec::new();
    let mut codes = Vec::new();
    let mut ready = Vec::new();
    for (number, line) in manifest.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match prepare_line(number + 1, line, &token) {
            Ok(request) => {
                ready.push((lines.len(), request));
                lines.push(String::new());
                codes.push(0);
            }
            Err(err) => {
                lines.push(serde_json::json!({ "error": format!("{err:#}") }).to_string());
                codes.push(1);
            }
        }
    }

    let (slots, requests): (Vec<usize>, Vec<ExtractionRequest>) = ready.into_iter().unzip();
    let results = service.extract_many(requests).await;
    for (slot, result) in slots.into_iter().zip(results) {
        match result {
            Ok(record) => lines[slot] = record.to_json().to_string(),
            Err(err) => {
                lines[slot] = serde_json::json!({ "error": err.to_string() }).to_string();
                codes[slot] = failure_exit_code(&err);
            }
        }
    }

    let failures = codes.iter().filter(|code| **code != 0).count();
    let exit = codes.iter().copied().find(|code| *code != 0).unwrap_or(0);
    (lines, failures, exit)
}

pub fn handle_tasks(bundle: &ConfigBundle) -> Result<i32> {
    let registry = SchemaRegistry::with_overrides(&bundle.config.schemas)?;

    println!("Configuration: {}", bundle.paths.config_file.display());
    println!();
    for kind in registry.kinds() {
        let schema = registry.get(kind)?;
        println!("{kind}");
        for field in schema.fields() {
            let requirement = if field.required { "required" } else { "optional" };
            println!(
                "  {} ({requirement} {})",
                field.name,
                field.field_type.describe()
            );
        }
        println!();
    }
    Ok(0)
}

pub fn handle_schema(bundle: &ConfigBundle, kind: TaskKind) -> Result<i32> {
    let registry = SchemaRegistry::with_overrides(&bundle.config.schemas)?;
    let schema = registry.get(kind)?;

    println!("# Paste into config.toml and edit to override the '{kind}' schema.");
    println!("[schemas.{kind}]");
    println!("fields = [");
    for field in schema.fields() {
        println!("    {},", field_toml(field));
    }
    println!("]");
    Ok(0)
}

/// Maps a failed extraction to the process exit code: 3 when the retry budget
/// died on transport errors, 2 when the model kept producing invalid content.
fn failure_exit_code(err: &ExtractError) -> i32 {
    match err {
        ExtractError::RetryBudgetExhausted {
            last: AttemptFailure::Gateway(_),
            ..
        } => 3,
        ExtractError::RetryBudgetExhausted { .. } => 2,
        _ => 1,
    }
}

/// Turns a CLI image reference into an [`ImageSource`]. Local files are read
/// eagerly so a bad path fails before any model call.
fn resolve_image_ref(reference: &str) -> Result<ImageSource> {
    if reference == "-" {
        let mut bytes = Vec::new();
        io::stdin()
            .read_to_end(&mut bytes)
            .context("failed to read image from stdin")?;
        return Ok(ImageSource::Bytes(bytes));
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Ok(ImageSource::Url(reference.to_string()));
    }
    let path = PathBuf::from(reference);
    let bytes =
        fs::read(&path).with_context(|| format!("failed to read image '{}'", path.display()))?;
    Ok(ImageSource::Bytes(bytes))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });
    token
}

fn write_lines(lines: &[String], output: Option<&Path>, append: bool) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut body = lines.join("\n");
    body.push('\n');

    let Some(path) = output else {
        print!("{body}");
        return Ok(());
    };

    let file = if append {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open '{}' for appending", path.display()))?
    } else {
        fs::File::create(path)
            .with_context(|| format!("failed to create '{}'", path.display()))?
    };
    let mut writer = io::BufWriter::new(file);
    writer.write_all(body.as_bytes())?;
    writer.flush()?;
    Ok(())
}

fn field_toml(field: &FieldSpec) -> String {
    let mut parts = vec![
        format!("name = \"{}\"", field.name),
        format!("type = \"{}\"", type_keyword(&field.field_type)),
    ];
    match &field.field_type {
        FieldType::Enum(values) => {
            let rendered = values
                .iter()
                .map(|value| format!("\"{value}\""))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("values = [{rendered}]"));
        }
        FieldType::Date(format) => parts.push(format!("format = \"{format}\"")),
        _ => {}
    }
    if !field.required {
        parts.push("required = false".to_string());
    }
    if field.missing_sentinel != DEFAULT_MISSING_SENTINEL {
        parts.push(format!("sentinel = \"{}\"", field.missing_sentinel));
    }
    format!("{{ {} }}", parts.join(", "))
}

fn type_keyword(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::Integer => "integer",
        FieldType::Float => "float",
        FieldType::String => "string",
        FieldType::Enum(_) => "enum",
        FieldType::Date(_) => "date",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use async_trait::async_trait;
    use vxtr_core::GatewayError;
    use vxtr_core::Message;
    use vxtr_core::ModelGateway;
    use vxtr_core::RawModelOutput;

    #[test]
    fn gateway_exhaustion_exits_three() {
        let err = ExtractError::RetryBudgetExhausted {
            attempts: 3,
            last: AttemptFailure::Gateway(GatewayError::Unavailable {
                reason: "connection refused".to_string(),
            }),
        };
        assert_eq!(failure_exit_code(&err), 3);
    }

    #[test]
    fn content_exhaustion_exits_two() {
        let err = ExtractError::RetryBudgetExhausted {
            attempts: 3,
            last: AttemptFailure::Malformed {
                reason: "no JSON object found".to_string(),
                raw_text: "sorry".to_string(),
            },
        };
        assert_eq!(failure_exit_code(&err), 2);
    }

    #[test]
    fn other_errors_exit_one() {
        assert_eq!(failure_exit_code(&ExtractError::Cancelled), 1);
        assert_eq!(
            failure_exit_code(&ExtractError::UnknownTaskKind("invoice".to_string())),
            1
        );
    }

    #[test]
    fn url_refs_stay_remote() {
        let source = resolve_image_ref("https://example.com/receipt.png").unwrap();
        assert!(matches!(source, ImageSource::Url(_)));
    }

    #[test]
    fn file_refs_are_read_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        fs::write(&path, b"fake-png").unwrap();

        let source = resolve_image_ref(path.to_str().unwrap()).unwrap();
        assert!(matches!(source, ImageSource::Bytes(bytes) if bytes == b"fake-png"));

        let missing = dir.path().join("absent.png");
        assert!(resolve_image_ref(missing.to_str().unwrap()).is_err());
    }

    #[test]
    fn manifest_lines_parse_with_optional_note() {
        let entry: ManifestLine =
            serde_json::from_str(r#"{"task": "receipt", "image": "a.png"}"#).unwrap();
        assert_eq!(entry.task, "receipt");
        assert!(entry.note.is_none());

        let entry: ManifestLine = serde_json::from_str(
            r#"{"task": "profile", "image": "b.png", "note": "crop is tight"}"#,
        )
        .unwrap();
        assert_eq!(entry.note.as_deref(), Some("crop is tight"));
    }

    /// Answers every call with the same canned response text.
    struct CannedGateway {
        text: String,
    }

    #[async_trait]
    impl ModelGateway for CannedGateway {
        async fn generate(&self, _message: &Message) -> Result<RawModelOutput, GatewayError> {
            Ok(RawModelOutput {
                text: self.text.clone(),
                token_count: 7,
            })
        }
    }

    #[tokio::test]
    async fn batch_keeps_going_past_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("receipt.png");
        fs::write(&image, b"fake-png").unwrap();
        let image_ref = image.to_str().unwrap();

        let manifest = format!(
            "{}\nnot json at all\n{}\n{}\n",
            serde_json::json!({"task": "receipt", "image": image_ref}),
            serde_json::json!({"task": "receipt", "image": image_ref}),
            serde_json::json!({"task": "invoice", "image": image_ref}),
        );

        let gateway = CannedGateway {
            text: r#"{"place_name": "Cafe Nova", "date": "05/03/2024", "total": "23,50"}"#
                .to_string(),
        };
        let service =
            ExtractionService::from_parts(SchemaRegistry::builtin(), Arc::new(gateway), 3);

        let (lines, failures, exit) =
            run_batch(&service, &manifest, CancellationToken::new()).await;

        // Both well-formed receipt lines extract; the unparsable line and the
        // unknown task each become their own error line, in input order.
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("Cafe Nova"));
        assert!(lines[1].contains("manifest line 2"));
        assert!(lines[2].contains("Cafe Nova"));
        assert!(lines[3].contains("error"));
        assert_eq!(failures, 2);
        assert_eq!(exit, 1);
    }

    #[test]
    fn schema_skeleton_lines_render_field_constraints() {
        let field = FieldSpec::optional("tip", FieldType::Float);
        assert_eq!(
            field_toml(&field),
            r#"{ name = "tip", type = "float", required = false }"#
        );

        let field = FieldSpec::required(
            "category",
            FieldType::Enum(vec!["cash".to_string(), "card".to_string()]),
        );
        assert_eq!(
            field_toml(&field),
            r#"{ name = "category", type = "enum", values = ["cash", "card"] }"#
        );

        let field = FieldSpec::required("date", FieldType::Date("DD/MM/YYYY".to_string()));
        assert_eq!(
            field_toml(&field),
            r#"{ name = "date", type = "date", format = "DD/MM/YYYY" }"#
        );
    }
}
