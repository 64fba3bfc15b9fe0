use std::{env, fs, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use scalpel::{
    commands,
    config::{ConfigManager, EnvConfigManager, ROOT_KEY, Settings},
    editor::{QueuedDispatcher, WidgetKind},
    http::MessageKind,
    logger::{LogLevel, init_tracing},
    provider::EditorProvider,
    registry::EditorRegistry,
    script::ScriptExecutor,
    watcher::ScriptWatcher,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "scalpel",
    about = "Script-driven editors for HTTP traffic",
    version
)]
struct Cli {
    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the editor channels a script defines
    Channels(ChannelsArgs),

    /// Show the tabs a script produces for a message
    Edit(EditArgs),

    /// Edit one tab and print the message that would be sent
    Apply(ApplyArgs),

    /// Keep the configured script loaded and reload it on change
    Watch,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Request,
    Response,
}

impl From<KindArg> for MessageKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Request => MessageKind::Request,
            KindArg::Response => MessageKind::Response,
        }
    }
}

#[derive(Args, Debug)]
struct ChannelsArgs {
    script: PathBuf,

    /// Print the catalog as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MessageArgs {
    script: PathBuf,

    /// File holding the raw HTTP message
    message: PathBuf,

    #[arg(long, value_enum, default_value = "request")]
    kind: KindArg,

    /// Service URL, e.g. https://example.com:8443. Defaults to the Host header
    #[arg(long)]
    service: Option<String>,

    /// Editor widget (raw or hex). Defaults to SCALPEL_EDITOR
    #[arg(long)]
    editor: Option<String>,
}

#[derive(Args, Debug)]
struct EditArgs {
    #[command(flatten)]
    message: MessageArgs,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    message: MessageArgs,

    /// Label of the tab to edit
    #[arg(long)]
    tab: String,

    /// File holding the edited tab content
    #[arg(long)]
    content: PathBuf,
}

/// Resolve the working root from the environment or use the default.
pub fn resolve_root_dir() -> PathBuf {
    env::var(ROOT_KEY)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./scalpel"))
}

fn widgets(args: &MessageArgs, settings: &Settings) -> anyhow::Result<WidgetKind> {
    match &args.editor {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(settings.editor),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let root = resolve_root_dir();
    let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let mut settings = Settings::load(&config).await?;
    if let Some(level) = &cli.log_level {
        settings.log_level = LogLevel::parse(level);
    }

    // only `watch` talks on the terminal; the others print results there
    let interactive = matches!(cli.command, Commands::Watch);
    let _guards = init_tracing(&settings.log_dir, settings.log_level, interactive)?;

    match cli.command {
        Commands::Channels(args) => {
            let catalog = commands::channels(&args.script)?;
            print!("{}", commands::render_channels(&catalog, args.json)?);
        }
        Commands::Edit(args) => {
            let widgets = widgets(&args.message, &settings)?;
            let (message, service) = commands::read_message(
                &args.message.message,
                args.message.kind.into(),
                args.message.service.as_deref(),
            )?;
            let views = commands::edit(&args.message.script, &message, &service, widgets)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&views)?);
            } else if views.is_empty() {
                println!("no tab is visible for this message");
            } else {
                for view in views {
                    let mode = if view.editable { "" } else { " (read-only)" };
                    println!("== {}{mode} ==\n{}\n", view.label, view.content);
                }
            }
        }
        Commands::Apply(args) => {
            let widgets = widgets(&args.message, &settings)?;
            let (message, service) = commands::read_message(
                &args.message.message,
                args.message.kind.into(),
                args.message.service.as_deref(),
            )?;
            let content = fs::read_to_string(&args.content)
                .with_context(|| format!("reading {}", args.content.display()))?;
            let out = commands::apply(
                &args.message.script,
                &message,
                &service,
                &args.tab,
                &content,
                widgets,
            )?;
            print!("{}", String::from_utf8_lossy(out.as_bytes()));
        }
        Commands::Watch => watch(settings).await?,
    }
    Ok(())
}

async fn watch(settings: Settings) -> anyhow::Result<()> {
    let script = settings.require_script()?.to_path_buf();

    let executor = ScriptExecutor::new();
    if !settings.enabled {
        executor.disable();
    }
    let (dispatcher, ui) = QueuedDispatcher::new();
    let provider = Arc::new(EditorProvider::new(
        executor,
        EditorRegistry::new(),
        Arc::new(dispatcher),
        settings.editor,
    ));
    let ui_task = tokio::spawn(ui.run());

    let watcher = ScriptWatcher::new(script.clone(), provider.clone())
        .watch(settings.watch_interval)
        .await?;
    info!(script = %script.display(), enabled = settings.enabled, "watching script, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    watcher.shutdown();
    drop(provider);
    ui_task.abort();
    Ok(())
}
