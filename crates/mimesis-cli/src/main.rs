use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mimesis_contracts::analysis::AnalysisOutcome;
use mimesis_contracts::events::{EventPayload, SessionLog};
use mimesis_contracts::files::{mime_for_file_name, FileCandidate};
use mimesis_contracts::receipts::{build_receipt, write_receipt};
use mimesis_contracts::repl::{parse_repl_command, ReplCommand, REPL_HELP_COMMANDS};
use mimesis_contracts::session::{SessionPhase, SessionState};
use mimesis_engine::{
    default_provider_registry, encode_file_to_data_uri, normalize_outcome, run_analysis,
    AnalysisProvider, EncodedUpload,
};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mimesis-rs", version, about = "Mimesis audience-analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze one file and print the result.
    Analyze(AnalyzeArgs),
    /// Interactive session: select, analyze, and reset like the upload UI.
    Session(SessionArgs),
    /// List the registered analysis providers.
    Providers,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = "gemini-2.5-flash")]
    model: String,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long, default_value = "gemini-2.5-flash")]
    model: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mimesis-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze_native(args),
        Command::Session(args) => {
            run_session_native(args)?;
            Ok(0)
        }
        Command::Providers => {
            for name in default_provider_registry().names() {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

fn run_analyze_native(args: AnalyzeArgs) -> Result<i32> {
    let session_id = Uuid::new_v4().to_string();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let log = SessionLog::new(events_path, session_id);
    let registry = default_provider_registry();
    let provider = resolve_provider(&registry, &args.provider)?;

    let mut session = SessionState::new();
    let candidate = candidate_from_path(&args.file)?;
    if let Err(refusal) = session.select_file(candidate.clone()) {
        let mut payload = EventPayload::new();
        payload.insert("file_name".to_string(), Value::String(candidate.name));
        payload.insert("reason".to_string(), Value::String(refusal.to_string()));
        log.emit("file_rejected", payload)?;
        println!("{refusal}");
        return Ok(1);
    }
    log.emit("file_selected", candidate_payload(&candidate))?;

    let outcome = perform_analysis(&mut session, provider, &args.model, &args.file, &args.out, &log)?;
    match &outcome {
        AnalysisOutcome::Success { analysis } => {
            println!("{analysis}");
            Ok(0)
        }
        AnalysisOutcome::Failure { error } => {
            println!("Analysis Failed: {error}");
            Ok(1)
        }
    }
}

fn run_session_native(args: SessionArgs) -> Result<()> {
    let session_id = Uuid::new_v4().to_string();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let log = SessionLog::new(events_path, session_id);
    let registry = default_provider_registry();
    let provider = resolve_provider(&registry, &args.provider)?;

    let mut session = SessionState::new();
    let mut selected_path: Option<PathBuf> = None;

    println!("Mimesis session started. Type /help for commands.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_repl_command(&line) {
            ReplCommand::Noop => continue,
            ReplCommand::Help => {
                println!("Commands: {}", REPL_HELP_COMMANDS.join(" "));
            }
            ReplCommand::Quit => break,
            ReplCommand::Status => {
                println!("phase: {}", session.phase());
                match session.file() {
                    Some(file) => println!(
                        "file: {} ({}, {} bytes)",
                        file.name,
                        file.mime_type.as_deref().unwrap_or("unknown"),
                        file.size_bytes
                    ),
                    None => println!("file: none"),
                }
                if let Some(analysis) = session.analysis() {
                    println!("analysis: {analysis}");
                }
                if let Some(error) = session.error() {
                    println!("error: {error}");
                }
            }
            ReplCommand::Select { path } => {
                let path = PathBuf::from(path);
                let candidate = match candidate_from_path(&path) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        println!("Cannot select file: {err:#}");
                        continue;
                    }
                };
                match session.select_file(candidate.clone()) {
                    Ok(()) => {
                        log.emit("file_selected", candidate_payload(&candidate))?;
                        selected_path = Some(path);
                        println!(
                            "Selected {} ({}, {} bytes)",
                            candidate.name,
                            candidate.mime_type.as_deref().unwrap_or("unknown"),
                            candidate.size_bytes
                        );
                    }
                    Err(refusal) => {
                        let mut payload = EventPayload::new();
                        payload.insert(
                            "file_name".to_string(),
                            Value::String(candidate.name.clone()),
                        );
                        payload.insert(
                            "reason".to_string(),
                            Value::String(refusal.to_string()),
                        );
                        log.emit("file_rejected", payload)?;
                        println!("{refusal}");
                    }
                }
            }
            ReplCommand::Remove => match session.remove_file() {
                Ok(()) => {
                    log.emit("file_removed", EventPayload::new())?;
                    selected_path = None;
                    println!("File removed.");
                }
                Err(refusal) => println!("Cannot remove file: {refusal}"),
            },
            ReplCommand::Analyze => {
                let Some(path) = selected_path.clone() else {
                    println!("No file selected. Use /select <path> first.");
                    continue;
                };
                let outcome =
                    perform_analysis(&mut session, provider, &args.model, &path, &args.out, &log)?;
                match &outcome {
                    AnalysisOutcome::Success { analysis } => {
                        println!("Analysis Complete\n{analysis}");
                    }
                    AnalysisOutcome::Failure { error } => {
                        println!("Analysis Failed: {error}");
                    }
                }
            }
            ReplCommand::Unknown { raw } => {
                println!("Unrecognized input '{raw}'. Type /help for commands.");
            }
        }
    }

    log.emit("session_finished", EventPayload::new())?;
    Ok(())
}

/// Drive one analysis round trip: loading transition, file read + encode,
/// provider call, receipt, events, and the settled phase. Every failure
/// becomes a uniform outcome; the session never stays in `loading`.
fn perform_analysis(
    session: &mut SessionState,
    provider: &dyn AnalysisProvider,
    model: &str,
    path: &Path,
    out_dir: &Path,
    log: &SessionLog,
) -> Result<AnalysisOutcome> {
    if let Err(refusal) = session.begin_analysis() {
        return Ok(AnalysisOutcome::failure(refusal.to_string()));
    }
    let mut payload = EventPayload::new();
    payload.insert(
        "provider".to_string(),
        Value::String(provider.name().to_string()),
    );
    payload.insert("model".to_string(), Value::String(model.to_string()));
    log.emit("analysis_started", payload)?;

    let (upload, outcome, response) = match encode_file_to_data_uri(path) {
        Ok(upload) => {
            let (outcome, response) = normalize_outcome(run_analysis(provider, model, &upload.data_uri));
            (Some(upload), outcome, response)
        }
        Err(err) => {
            let mut payload = EventPayload::new();
            payload.insert("detail".to_string(), Value::String(format!("{err:#}")));
            log.emit("file_read_failed", payload)?;
            (None, AnalysisOutcome::failure("Failed to read file."), None)
        }
    };

    session
        .complete_analysis(&outcome)
        .map_err(|refusal| anyhow::anyhow!("session refused completion: {refusal}"))?;

    let receipt_path = out_dir.join(format!("receipt-{}.json", timestamp_millis()));
    let file_metadata = upload
        .as_ref()
        .map(EncodedUpload::metadata)
        .unwrap_or_else(|| {
            candidate_from_path(path)
                .map(|candidate| candidate_payload(&candidate))
                .unwrap_or_default()
        });
    let provider_request = response
        .as_ref()
        .map(|row| row.provider_request.clone())
        .unwrap_or_default();
    let provider_response = response
        .as_ref()
        .map(|row| row.provider_response.clone())
        .unwrap_or_default();
    let warnings = response
        .as_ref()
        .map(|row| row.warnings.clone())
        .unwrap_or_default();
    let receipt = build_receipt(
        &file_metadata,
        provider.name(),
        model,
        &provider_request,
        &provider_response,
        &warnings,
        &outcome.to_value(),
        &receipt_path,
    );
    write_receipt(&receipt_path, &receipt)?;

    match &outcome {
        AnalysisOutcome::Success { analysis } => {
            let mut payload = EventPayload::new();
            payload.insert(
                "receipt_path".to_string(),
                Value::String(receipt_path.to_string_lossy().to_string()),
            );
            payload.insert(
                "analysis_chars".to_string(),
                Value::Number(analysis.chars().count().into()),
            );
            log.emit("analysis_succeeded", payload)?;
        }
        AnalysisOutcome::Failure { error } => {
            let mut payload = EventPayload::new();
            payload.insert("error".to_string(), Value::String(error.clone()));
            payload.insert(
                "receipt_path".to_string(),
                Value::String(receipt_path.to_string_lossy().to_string()),
            );
            log.emit("analysis_failed", payload)?;
        }
    }
    debug_assert_ne!(session.phase(), SessionPhase::Loading);

    Ok(outcome)
}

fn resolve_provider<'a>(
    registry: &'a mimesis_engine::AnalysisProviderRegistry,
    name: &str,
) -> Result<&'a dyn AnalysisProvider> {
    registry.get(name).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown provider '{name}'; available: {}",
            registry.names().join(", ")
        )
    })
}

fn candidate_from_path(path: &Path) -> Result<FileCandidate> {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("path has no usable file name: {}", path.display()))?;
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed reading metadata for {}", path.display()))?;
    Ok(FileCandidate {
        mime_type: mime_for_file_name(&name).map(str::to_string),
        name,
        size_bytes: metadata.len(),
    })
}

fn candidate_payload(candidate: &FileCandidate) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(
        "file_name".to_string(),
        Value::String(candidate.name.clone()),
    );
    payload.insert(
        "mime_type".to_string(),
        candidate
            .mime_type
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "size_bytes".to_string(),
        Value::Number(candidate.size_bytes.into()),
    );
    payload
}

fn timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use mimesis_contracts::events::read_event_types;
    use serde_json::Value;

    use super::{candidate_from_path, run_analyze_native, AnalyzeArgs};

    #[test]
    fn candidate_from_path_maps_name_mime_and_size() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("board.fig");
        std::fs::write(&path, b"12345")?;

        let candidate = candidate_from_path(&path)?;
        assert_eq!(candidate.name, "board.fig");
        assert_eq!(candidate.mime_type.as_deref(), Some("application/x-figma"));
        assert_eq!(candidate.size_bytes, 5);

        let unknown = temp.path().join("notes.txt");
        std::fs::write(&unknown, b"hi")?;
        let candidate = candidate_from_path(&unknown)?;
        assert_eq!(candidate.mime_type, None);
        Ok(())
    }

    #[test]
    fn one_shot_dryrun_analysis_writes_receipt_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("board.fig");
        std::fs::write(&file, b"figma-binary")?;
        let out = temp.path().join("run");

        let code = run_analyze_native(AnalyzeArgs {
            file,
            out: out.clone(),
            events: None,
            provider: "dryrun".to_string(),
            model: "dryrun-analysis-1".to_string(),
        })?;
        assert_eq!(code, 0);

        let types = read_event_types(&out.join("events.jsonl"));
        assert!(types.contains(&"file_selected".to_string()));
        assert!(types.contains(&"analysis_started".to_string()));
        assert!(types.contains(&"analysis_succeeded".to_string()));

        let receipt = std::fs::read_dir(&out)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .find(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("receipt-"))
                    .unwrap_or(false)
            })
            .expect("receipt written");
        let payload: Value = serde_json::from_str(&std::fs::read_to_string(receipt)?)?;
        assert_eq!(payload["outcome"]["success"], Value::Bool(true));
        assert_eq!(payload["provider"], Value::String("dryrun".to_string()));
        Ok(())
    }

    #[test]
    fn unsupported_file_is_rejected_before_any_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("notes.txt");
        std::fs::write(&file, b"plain text")?;
        let out = temp.path().join("run");

        let code = run_analyze_native(AnalyzeArgs {
            file,
            out: out.clone(),
            events: None,
            provider: "dryrun".to_string(),
            model: "dryrun-analysis-1".to_string(),
        })?;
        assert_eq!(code, 1);

        let types = read_event_types(&out.join("events.jsonl"));
        assert_eq!(types, vec!["file_rejected".to_string()]);
        // No receipt: the call was never attempted.
        let receipts = std::fs::read_dir(&out)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path: &PathBuf| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("receipt-"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(receipts, 0);
        Ok(())
    }
}
