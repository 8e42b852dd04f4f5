use std::env;
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat};
use clap::{Parser, Subcommand};
use gomath_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use gomath_contracts::events::{SessionEvent, SessionLog};
use gomath_contracts::history::{HistoryItem, HistoryLog};
use gomath_contracts::models::{ModelsConfig, DEFAULT_CONFIG_PATH};
use gomath_contracts::steps::{render_steps, StepView};
use gomath_contracts::tasks::ResultCache;
use gomath_engine::{CallContext, Pipeline, SolvedTask};

const CONFIG_ENV: &str = "GOMATH_MODELS_CONFIG";
const HISTORY_ENV: &str = "GOMATH_HISTORY_FILE";
const DEFAULT_HISTORY_PATH: &str = "data/history.json";

#[derive(Debug, Parser)]
#[command(
    name = "gomath",
    version,
    about = "Recognize math problems and explain them step by step"
)]
struct Cli {
    /// Models config (TOML). Falls back to $GOMATH_MODELS_CONFIG, then config/models.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// History file. Falls back to $GOMATH_HISTORY_FILE, then data/history.json.
    #[arg(long, global = true)]
    history: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print which models are configured.
    Status,
    Recognize(RecognizeArgs),
    Explain(ExplainArgs),
    History(HistoryArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct RecognizeArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct ExplainArgs {
    #[arg(long, conflicts_with = "image", required_unless_present = "image")]
    text: Option<String>,
    #[arg(long)]
    image: Option<PathBuf>,
    /// Print the steps as a JSON array.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[command(subcommand)]
    command: HistoryCommand,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List,
    Show { id: String },
    Delete { id: String },
    FindUpload { path: String },
}

#[derive(Debug, Parser)]
struct ChatArgs {
    /// Append session events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("gomath error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = resolve_path(cli.config, CONFIG_ENV, DEFAULT_CONFIG_PATH);
    let config = load_models_config(&config_path)?;

    if let Command::Status = cli.command {
        println!("{}", config.status());
        return Ok(0);
    }
    log::info!("{}", config.status());

    let history_path = resolve_path(cli.history, HISTORY_ENV, DEFAULT_HISTORY_PATH);
    let history = Arc::new(
        HistoryLog::open(&history_path)
            .with_context(|| format!("open history {}", history_path.display()))?,
    );
    let pipeline = Pipeline::from_config(&config, Arc::new(ResultCache::new()), history);

    match cli.command {
        Command::Status => Ok(0),
        Command::Recognize(args) => {
            let recognized = pipeline.recognize_upload(&CallContext::new(), &args.image)?;
            println!("{}", recognized.text);
            Ok(0)
        }
        Command::Explain(args) => run_explain(&pipeline, args),
        Command::History(args) => run_history(pipeline.history(), args.command),
        Command::Chat(args) => {
            let events = args
                .events
                .map(|path| SessionLog::open(path, uuid::Uuid::new_v4().to_string()))
                .transpose()?;
            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut output = io::stdout();
            run_chat_session(&pipeline, &config, events.as_ref(), &mut input, &mut output)?;
            Ok(0)
        }
    }
}

/// Flag, then environment variable, then the built-in default.
fn resolve_path(flag: Option<PathBuf>, env_key: &str, default: &str) -> PathBuf {
    flag.or_else(|| {
        env::var(env_key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(default))
}

/// Loads the models config; a missing default file means nothing is configured.
fn load_models_config(path: &Path) -> Result<ModelsConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_PATH) {
        log::warn!(
            "{} not found; recognition and explanation run unconfigured",
            path.display()
        );
        return Ok(ModelsConfig::default());
    }
    let mut config = ModelsConfig::load(path)?;
    config.resolve_api_keys();
    Ok(config)
}

fn run_explain(pipeline: &Pipeline, args: ExplainArgs) -> Result<i32> {
    let ctx = CallContext::new();
    let solved = match (args.text, args.image) {
        (Some(text), None) => pipeline.explain_text(&ctx, &text)?,
        (None, Some(image)) => pipeline.explain_upload(&ctx, &image)?,
        _ => bail!("explain needs exactly one of --text or --image"),
    };
    if args.json {
        println!("{}", render_steps(&solved.explanation));
    } else {
        print!("{}", format_solved(&solved));
    }
    Ok(0)
}

fn run_history(history: &HistoryLog, command: HistoryCommand) -> Result<i32> {
    match command {
        HistoryCommand::List => {
            let items = history.list();
            if items.is_empty() {
                println!("History is empty.");
            }
            for item in &items {
                println!("{}", format_history_line(item));
            }
            Ok(0)
        }
        HistoryCommand::Show { id } => {
            let Some(item) = history.get(&id) else {
                bail!("history item not found: {id}");
            };
            println!("{}", serde_json::to_string_pretty(&item)?);
            Ok(0)
        }
        HistoryCommand::Delete { id } => {
            if !history.delete(&id) {
                bail!("history item not found: {id}");
            }
            println!("Deleted {id}");
            Ok(0)
        }
        HistoryCommand::FindUpload { path } => match history.find_latest_upload_by_path(&path) {
            Some(item) => {
                println!("{}", format_history_line(&item));
                Ok(0)
            }
            None => {
                println!("No upload recorded for {path}");
                Ok(1)
            }
        },
    }
}

fn run_chat_session(
    pipeline: &Pipeline,
    config: &ModelsConfig,
    events: Option<&SessionLog>,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<()> {
    let emit = |event: SessionEvent| -> Result<()> {
        if let Some(events) = events {
            events.record(&event)?;
        }
        Ok(())
    };
    let mut line = String::new();

    emit(SessionEvent::SessionStarted {
        status: config.status(),
    })?;
    writeln!(output, "gomath chat started. Type /help for commands.")?;

    loop {
        write!(output, "> ")?;
        output.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        let ctx = CallContext::new();
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => writeln!(output, "Commands: {}", CHAT_HELP_COMMANDS.join(" "))?,
            "status" => writeln!(output, "{}", config.status())?,
            "recognize" => {
                let Some(path) = intent.arg("path") else {
                    writeln!(output, "/recognize requires a path")?;
                    continue;
                };
                match pipeline.recognize_upload(&ctx, Path::new(path)) {
                    Ok(recognized) => {
                        emit(SessionEvent::ProblemRecognized {
                            image_path: path.to_string(),
                            history_id: recognized.history_id.clone(),
                            text: recognized.text.clone(),
                        })?;
                        writeln!(output, "{}", recognized.text)?;
                    }
                    Err(err) => {
                        emit(SessionEvent::RecognitionFailed {
                            image_path: path.to_string(),
                            error: err.to_string(),
                        })?;
                        writeln!(output, "Recognize failed: {err}")?;
                    }
                }
            }
            "explain" | "explain_image" => {
                let outcome = if intent.action == "explain" {
                    let Some(text) = intent.arg("text") else {
                        writeln!(output, "/explain requires problem text")?;
                        continue;
                    };
                    pipeline.explain_text(&ctx, text)
                } else {
                    let Some(path) = intent.arg("path") else {
                        writeln!(output, "/explain_image requires a path")?;
                        continue;
                    };
                    pipeline.explain_upload(&ctx, Path::new(path))
                };
                match outcome {
                    Ok(solved) => {
                        emit(SessionEvent::ExplanationStored {
                            task_id: solved.task_id.clone(),
                            history_id: solved.history_id.clone(),
                            steps: solved.steps.len(),
                        })?;
                        write!(output, "{}", format_solved(&solved))?;
                    }
                    Err(err) => {
                        emit(SessionEvent::ExplanationFailed {
                            error: err.to_string(),
                        })?;
                        writeln!(output, "Explain failed: {err}")?;
                    }
                }
            }
            "show_result" => {
                let Some(task_id) = intent.arg("task_id") else {
                    writeln!(output, "/result requires a task id")?;
                    continue;
                };
                match pipeline.cache().get(task_id) {
                    Ok(steps) => writeln!(output, "{}", serde_json::to_string_pretty(&steps)?)?,
                    Err(err) => writeln!(output, "{err}")?,
                }
            }
            "list_history" => {
                let items = pipeline.history().list();
                if items.is_empty() {
                    writeln!(output, "History is empty.")?;
                }
                for item in &items {
                    writeln!(output, "{}", format_history_line(item))?;
                }
            }
            "show_history" => {
                let Some(id) = intent.arg("id") else {
                    writeln!(output, "/show requires a history id")?;
                    continue;
                };
                match pipeline.history().get(id) {
                    Some(item) => writeln!(output, "{}", serde_json::to_string_pretty(&item)?)?,
                    None => writeln!(output, "history item not found: {id}")?,
                }
            }
            "delete_history" => {
                let Some(id) = intent.arg("id") else {
                    writeln!(output, "/delete requires a history id")?;
                    continue;
                };
                if pipeline.history().delete(id) {
                    emit(SessionEvent::HistoryDeleted {
                        history_id: id.to_string(),
                    })?;
                    writeln!(output, "Deleted {id}")?;
                } else {
                    writeln!(output, "history item not found: {id}")?;
                }
            }
            "find_upload" => {
                let Some(path) = intent.arg("path") else {
                    writeln!(output, "/find_upload requires a path")?;
                    continue;
                };
                match pipeline.history().find_latest_upload_by_path(path) {
                    Some(item) => writeln!(output, "{}", format_history_line(&item))?,
                    None => writeln!(output, "No upload recorded for {path}")?,
                }
            }
            _ => {
                let command = intent.arg("command").unwrap_or_default();
                writeln!(output, "Unknown command: /{command}. Type /help for commands.")?;
            }
        }
    }

    emit(SessionEvent::SessionEnded)?;
    Ok(())
}

fn format_solved(solved: &SolvedTask) -> String {
    let mut out = format!(
        "task {} (history {})\n",
        solved.task_id, solved.history_id
    );
    out.push_str(&format_steps(&solved.steps));
    out
}

fn format_steps(steps: &[StepView]) -> String {
    if steps.is_empty() {
        return "(no steps)\n".to_string();
    }
    let mut out = String::new();
    for (idx, view) in steps.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n{}\n", idx + 1, view.step.title, view.step.content));
        if let Some(url) = &view.image_url {
            out.push_str(&format!("[image: {url}]\n"));
        }
    }
    out
}

fn format_history_line(item: &HistoryItem) -> String {
    let when = DateTime::from_timestamp_millis(item.at)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| item.at.to_string());
    let marker = match &item.task_id {
        Some(task_id) => format!(" task={task_id}"),
        None if item.result.is_some() => " solved".to_string(),
        None => String::new(),
    };
    format!(
        "{}  {when}  {:<6}  {}{marker}",
        item.id,
        item.kind.as_str(),
        truncate_subject(item.subject(), 60)
    )
}

fn truncate_subject(value: &str, max_chars: usize) -> String {
    let single_line = value.split_whitespace().collect::<Vec<&str>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    single_line.chars().take(max_chars).collect::<String>() + "…"
}
