//! Command-line front end.
//!
//! `analyze` drives the whole page → background → window flow headlessly
//! against a PNG standing in for the visible tab.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::browser::TabDirectory;
use crate::conversation::ConversationSession;
use crate::geometry::{LogicalPoint, LogicalRect};
use crate::handoff::LocalStore;
use crate::llm::AnalysisClient;
use crate::orchestrator::{Orchestrator, OrchestratorHandle};
use crate::overlay::{PageEvent, PageScope};
use crate::settings::{AppConfig, SettingsStore};

const TAB_ID: u32 = 1;

/// snapsight - select a region of a page and ask a vision model about it
#[derive(Parser)]
#[command(name = "snapsight")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Select a region of a rendered page and analyze it
    Analyze {
        /// PNG of the visible viewport, at device resolution
        #[arg(long, value_name = "PNG")]
        frame: PathBuf,

        /// Selection origin and size in logical (CSS) pixels
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,
        #[arg(long)]
        width: f64,
        #[arg(long)]
        height: f64,

        /// Device pixel ratio of the page
        #[arg(long, default_value_t = 1.0)]
        dpr: f64,

        /// URL the page is showing
        #[arg(long, default_value = "https://example.com/")]
        url: String,

        /// Follow-up questions, asked in order after the first analysis
        #[arg(long = "ask", value_name = "PROMPT")]
        ask: Vec<String>,
    },

    /// Validate and store the Groq API key
    SetKey {
        /// Key starting with gsk_
        key: String,
    },

    /// Print usage statistics
    Stats,
}

pub async fn execute(cli: Cli) -> Result<(), String> {
    run_command(cli, AppConfig::from_env()).await
}

/// Dispatch one subcommand against an explicit configuration.
pub async fn run_command(cli: Cli, config: AppConfig) -> Result<(), String> {
    let settings = SettingsStore::new(&config.config_dir);

    match cli.command {
        Commands::SetKey { key } => {
            settings.save_api_key(&key).map_err(|e| e.to_string())?;
            println!("API key saved to {}", settings.path().display());
            Ok(())
        }
        Commands::Stats => {
            let store = LocalStore::new(&config.data_dir);
            let stats = store.usage_stats().map_err(|e| e.to_string())?;
            let json = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
            println!("{}", json);
            Ok(())
        }
        Commands::Analyze {
            frame,
            x,
            y,
            width,
            height,
            dpr,
            url,
            ask,
        } => {
            welcome_once(&settings);
            let selection = LogicalRect {
                x,
                y,
                width,
                height,
            };
            analyze(config, settings, AnalyzeArgs { frame, selection, dpr, url, ask }).await
        }
    }
}

/// Onboarding hint, printed the first time a capture is attempted.
fn welcome_once(settings: &SettingsStore) {
    match settings.mark_welcome_seen() {
        Ok(true) => println!(
            "Welcome to snapsight. Set your Groq API key with `snapsight set-key <KEY>` \
             or the GROQ_API_KEY environment variable."
        ),
        Ok(false) => {}
        Err(e) => log::warn!("[SETTINGS] {}", e),
    }
}

struct AnalyzeArgs {
    frame: PathBuf,
    selection: LogicalRect,
    dpr: f64,
    url: String,
    ask: Vec<String>,
}

async fn analyze(
    config: AppConfig,
    settings: SettingsStore,
    args: AnalyzeArgs,
) -> Result<(), String> {
    if args.selection.is_below_threshold() {
        return Err("Selection must be at least 10x10 logical pixels".to_string());
    }
    let png = std::fs::read(&args.frame)
        .map_err(|e| format!("Failed to read {}: {}", args.frame.display(), e))?;

    let tabs = Arc::new(TabDirectory::new());
    tabs.open_tab(TAB_ID, &args.url);
    tabs.set_visible_content(TAB_ID, png)
        .map_err(|e| e.to_string())?;

    let store = Arc::new(LocalStore::new(&config.data_dir));
    let client = Arc::new(AnalysisClient::new(config.provider, Arc::new(settings)));
    let (window_tx, mut window_rx) = mpsc::unbounded_channel::<String>();

    let orchestrator = Orchestrator::new(tabs.clone(), client, store.clone(), Arc::new(window_tx))
        .with_capture_config(config.capture)
        .with_retry_policy(config.overlay_retry)
        .spawn();

    let result = drive(&orchestrator, &tabs, &store, &mut window_rx, &args).await;
    orchestrator.shutdown().await;
    result
}

async fn drive(
    orchestrator: &OrchestratorHandle,
    tabs: &TabDirectory,
    store: &Arc<LocalStore>,
    window_rx: &mut mpsc::UnboundedReceiver<String>,
    args: &AnalyzeArgs,
) -> Result<(), String> {
    let channel = orchestrator.channel();

    // Page context: inject the overlay, then arm it the way the shortcut does.
    let page = PageScope::new(TAB_ID, args.dpr);
    let overlay = page
        .inject_overlay(tabs, channel)
        .map_err(|e| e.to_string())?;
    let active = channel
        .toggle_capture_mode(Some(TAB_ID))
        .await
        .map_err(|e| e.to_string())?;
    if !active {
        return Err("Capture mode did not turn on".to_string());
    }

    let sel = args.selection;
    let start = LogicalPoint::new(sel.x, sel.y);
    let end = LogicalPoint::new(sel.x + sel.width, sel.y + sel.height);
    let mid = LogicalPoint::new(sel.x + sel.width / 2.0, sel.y + sel.height / 2.0);
    for event in [
        PageEvent::PointerDown(start),
        PageEvent::PointerMove(mid),
        PageEvent::PointerUp(end),
    ] {
        if !overlay.dispatch(event).await {
            return Err("Page closed before the selection finished".to_string());
        }
    }

    // Window context: wait for the router to open it, or for the page to
    // show an error.
    let handoff_id = tokio::select! {
        opened = window_rx.recv() => {
            opened.ok_or("Conversation window never opened")?
        }
        view = overlay.wait_for(|v| v.error_banner.is_some()) => {
            let message = view
                .and_then(|v| v.error_banner)
                .unwrap_or_else(|| "Page closed unexpectedly".to_string());
            return Err(message);
        }
    };

    let mut session = ConversationSession::open(channel.clone(), store.clone(), &handoff_id)
        .map_err(|e| e.to_string())?
        .ok_or("No image data found")?;
    println!("{}", session.initial_analysis());

    for prompt in &args.ask {
        match session.ask(prompt).await {
            Ok(Some(answer)) => println!("\n> {}\n{}", prompt.trim(), answer),
            Ok(None) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}
