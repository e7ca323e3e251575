mod config;
mod web;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diagen_contracts::events::EventWriter;
use diagen_contracts::receipts::{write_receipt, ImageSummary, RenderReceipt};
use diagen_engine::notices::{NoticeLevel, Notices};
use diagen_engine::{DiagramEngine, ReviewRequest};
use serde_json::{json, Map, Value};

use crate::config::{resolve, EnvLayers, Settings, SettingsArgs, DOTENV_FILE};

#[derive(Debug, Parser)]
#[command(
    name = "diagen",
    version,
    about = "Generate architecture diagrams with Claude on Bedrock"
)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the models offered for code generation.
    Models,
    Review(ReviewArgs),
    Render(RenderArgs),
    /// Serve the browser form.
    Serve(ServeArgs),
}

/// Ask the model for diagram code.
#[derive(Debug, Parser)]
struct ReviewArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    /// Write the code here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Run diagram code and save the image it produces.
#[derive(Debug, Parser)]
struct RenderArgs {
    #[arg(long)]
    code: PathBuf,
    #[arg(long, default_value = "example_diagram.png")]
    out: PathBuf,
    #[arg(long)]
    receipt: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long)]
    listen: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("diagen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let layers = EnvLayers::from_process(Path::new(DOTENV_FILE));
    let listen = match &cli.command {
        Command::Serve(args) => args.listen.as_deref(),
        _ => None,
    };
    let settings = resolve(&cli.settings, listen, &layers)?;
    match cli.command {
        Command::Models => run_models(),
        Command::Review(args) => run_review(&settings, args),
        Command::Render(args) => run_render(&settings, args),
        Command::Serve(_) => run_serve(&settings),
    }
}

fn build_engine(settings: &Settings) -> Result<DiagramEngine> {
    let events = EventWriter::from_optional(
        settings.events_path.clone(),
        uuid::Uuid::new_v4().to_string(),
    );
    if let Some(path) = events.path() {
        eprintln!(
            "Session {}: logging events to {}",
            events.session_id(),
            path.display()
        );
    }
    DiagramEngine::new(settings.engine.clone(), events)
}

fn run_models() -> Result<i32> {
    for model in diagen_contracts::models::list_available_models() {
        println!("{}\t{}", model.id, model.label);
    }
    Ok(0)
}

fn run_review(settings: &Settings, args: ReviewArgs) -> Result<i32> {
    let engine = build_engine(settings)?;
    let outcome = engine.review(&ReviewRequest {
        prompt: args.prompt,
        model_id: args.model,
    });
    print_notices(&outcome.notices);
    let Some(code) = outcome.code else {
        return Ok(1);
    };
    match args.out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, format!("{code}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Code written to {}", path.display());
        }
        None => println!("{code}"),
    }
    Ok(0)
}

fn run_render(settings: &Settings, args: RenderArgs) -> Result<i32> {
    let code = fs::read_to_string(&args.code)
        .with_context(|| format!("failed to read {}", args.code.display()))?;
    let engine = build_engine(settings)?;
    let outcome = engine.generate(&code);
    print_notices(&outcome.notices);

    if let Some(image) = outcome.image() {
        image.save(&args.out)?;
        println!(
            "Diagram saved to {} ({}x{})",
            args.out.display(),
            image.width,
            image.height
        );
    }

    if let (Some(receipt_path), Some(run)) = (args.receipt.as_ref(), outcome.run.as_ref()) {
        let receipt = RenderReceipt {
            code_sha256: run.code_sha256.clone(),
            interpreter: run.interpreter.clone(),
            exit_code: run.exit_code,
            stdout: run.stdout.clone(),
            stderr: run.stderr.clone(),
            image: run.image.as_ref().map(|image| ImageSummary {
                path: args.out.display().to_string(),
                width: image.width,
                height: image.height,
                bytes: image.bytes.len() as u64,
            }),
        };
        let mut extra = Map::new();
        extra.insert("source".to_string(), json!(args.code.display().to_string()));
        extra.insert(
            "elapsed_ms".to_string(),
            Value::from(run.elapsed.as_millis() as u64),
        );
        write_receipt(receipt_path, &receipt, Some(&extra))?;
    }

    Ok(if outcome.image().is_some() { 0 } else { 1 })
}

fn run_serve(settings: &Settings) -> Result<i32> {
    // Built outside the runtime: the blocking HTTP clients inside must not be
    // created or dropped on an async worker.
    let engine = Arc::new(build_engine(settings)?);
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(web::serve(web::AppState::new(engine.clone()), &settings.listen))?;
    drop(runtime);
    drop(engine);
    Ok(0)
}

fn print_notices(notices: &Notices) {
    for notice in notices.iter() {
        match notice.level {
            NoticeLevel::Text => eprintln!("{}", notice.text.trim_end()),
            level => eprintln!("[{}] {}", level.as_str(), notice.text),
        }
    }
}
