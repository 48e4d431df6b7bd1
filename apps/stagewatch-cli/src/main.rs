use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use stagewatch_core::{
    config_schema_json, load_config, write_schema_file, Config, FreightState, LocalService,
    PromotionPhase, PromotionsView, ScopeKey,
};
use stagewatch_events::Bus;
use stagewatch_protocol::{Freight, Promotion, WatchPromotionEvent};
use tracing::info;

#[derive(Parser)]
#[command(name = "stagewatch", version, about = "Promotion list sync engine utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a fixture through the engine and print the resulting view (JSON)
    Replay(ReplayArgs),
    /// Print the phase classification table
    Phases(PhasesArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args)]
struct ReplayArgs {
    /// Fixture file: {"promotions": [...], "events": [...], "freight": [...]}
    #[arg(long)]
    fixture: PathBuf,
    /// Project (namespace) to view
    #[arg(long)]
    project: String,
    /// Stage to narrow the view to
    #[arg(long)]
    stage: Option<String>,
    /// Config file (TOML); defaults plus STAGEWATCH_* overrides when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hover the freight of the named promotion after the replay
    #[arg(long)]
    hover: Option<String>,
    /// Retry the named promotion after the replay
    #[arg(long)]
    retry: Option<String>,
    /// Pretty-print JSON
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct PhasesArgs {
    /// Emit JSON instead of a text table
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print (or write) the config JSON schema
    Schema {
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a config file and print the effective settings
    Check {
        path: PathBuf,
    },
}

#[derive(Args)]
struct CompletionsArgs {
    /// Target shell (bash, zsh, fish, powershell, elvish)
    shell: clap_complete::Shell,
    /// Output directory (writes a file). If not set, prints to stdout.
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    promotions: Vec<Promotion>,
    #[serde(default)]
    events: Vec<WatchPromotionEvent>,
    #[serde(default)]
    freight: Vec<Freight>,
}

fn main() {
    stagewatch_otel::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Replay(args) => cmd_replay(&args),
        Commands::Phases(args) => {
            print_phases(args.json);
            Ok(())
        }
        Commands::Config { cmd } => match cmd {
            ConfigCmd::Schema { out } => cmd_config_schema(out.as_deref()),
            ConfigCmd::Check { path } => cmd_config_check(&path),
        },
        Commands::Completions(args) => cmd_completions(args.shell, args.out_dir.as_deref()),
    };
    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn print_json(value: &JsonValue, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", value);
    }
    Ok(())
}

fn read_fixture(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing fixture {}", path.display()))
}

fn find_promotion(view: &PromotionsView, name: &str) -> Result<Promotion> {
    let scope = view.scope().ok_or_else(|| anyhow!("no scope open"))?;
    view.cache()
        .get(&scope.query_key())
        .and_then(|list| {
            list.promotions
                .iter()
                .find(|p| p.metadata.name == name)
                .cloned()
        })
        .ok_or_else(|| anyhow!("promotion {name} not found in {scope}"))
}

fn cmd_replay(args: &ReplayArgs) -> Result<()> {
    let cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::from_env(),
    };
    let fixture = read_fixture(&args.fixture)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let output = rt.block_on(replay(args, &cfg, fixture))?;
    print_json(&output, args.pretty)
}

async fn replay(args: &ReplayArgs, cfg: &Config, fixture: Fixture) -> Result<JsonValue> {
    let svc = LocalService::with_channel_capacity(cfg.watch.channel_capacity);
    svc.seed_promotions(fixture.promotions);
    for freight in fixture.freight {
        svc.insert_freight(freight);
    }

    let mut view = PromotionsView::new(
        Arc::new(svc.clone()),
        Bus::new(cfg.watch.bus_capacity),
        cfg,
    );
    let scope = ScopeKey::new(args.project.clone(), args.stage.as_deref());
    view.open(scope.clone()).await?;

    let total = fixture.events.len();
    let mut delivered = 0;
    for event in fixture.events {
        delivered += svc.emit(event).await;
    }
    svc.close_watchers();
    let closed = view.join().await;
    info!(%scope, total, delivered, "replay drained");

    if let Some(name) = &args.hover {
        let promotion = find_promotion(&view, name)?;
        let mut rx = view.freight().subscribe();
        view.hover_freight(&promotion);
        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|v| !matches!(v.state, FreightState::Loading)),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        if !settled {
            return Err(anyhow!("freight lookup for {name} did not settle"));
        }
    }

    let retry = match &args.retry {
        Some(name) => {
            let promotion = find_promotion(&view, name)?;
            Some(match view.retry(&promotion).await {
                Ok(request) => json!({"ok": true, "request": request}),
                Err(err) => json!({"ok": false, "error": err.to_string()}),
            })
        }
        None => None,
    };

    let mut output = json!({
        "scope": scope.to_string(),
        "version": view.version(),
        "events": {"total": total, "delivered": delivered},
        "closed": closed,
        "view": view.state(),
    });
    if let Some(retry) = retry {
        output["retry"] = retry;
    }
    view.close().await;
    Ok(output)
}

fn print_phases(as_json: bool) {
    if as_json {
        let rows: Vec<JsonValue> = PromotionPhase::ALL
            .iter()
            .map(|p| json!({"phase": p, "terminal": p.is_terminal(), "retryable": p.is_retryable()}))
            .collect();
        println!("{}", JsonValue::Array(rows));
        return;
    }
    println!("{:<10} {:<9} retryable", "phase", "terminal");
    for p in PromotionPhase::ALL {
        println!("{:<10} {:<9} {}", p.as_str(), p.is_terminal(), p.is_retryable());
    }
}

fn cmd_config_schema(out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            write_schema_file(path)
                .with_context(|| format!("writing schema {}", path.display()))?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        None => print_json(&config_schema_json(), true),
    }
}

fn cmd_config_check(path: &Path) -> Result<()> {
    let cfg = load_config(path)?;
    print_json(&serde_json::to_value(&cfg)?, true)
}

fn cmd_completions(shell: clap_complete::Shell, out_dir: Option<&Path>) -> Result<()> {
    use clap_complete::{generate, generate_to};
    use std::io::stdout;
    let mut cmd = Cli::command();
    let bin = "stagewatch";
    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir).ok();
        let path = generate_to(shell, &mut cmd, bin, dir)?;
        println!("Wrote {}", path.display());
    } else {
        generate(shell, &mut cmd, bin, &mut stdout());
    }
    Ok(())
}
