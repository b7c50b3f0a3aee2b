use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use kbmigrate_core::assets::{
    AssetPattern, LocalAssetLibrary, asset_list_path, list_asset_urls, write_asset_url_list,
};
use kbmigrate_core::config::{MigrateConfig, load_config};
use kbmigrate_core::crawl::{CrawlSettings, crawl_documents};
use kbmigrate_core::destination::{ConfluenceClient, ConfluenceClientConfig};
use kbmigrate_core::mirror::{MirrorSettings, mirror_documents};
use kbmigrate_core::model::DocumentKind;
use kbmigrate_core::reconcile::{ReconcileOptions, reconcile_snapshot};
use kbmigrate_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use kbmigrate_core::snapshot::{read_snapshot, write_snapshot};
use kbmigrate_core::source::{SourceClient, SourceClientConfig, ThreadPacer};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "kbmigrate=info,kbmigrate_core=info";

#[derive(Debug, Parser)]
#[command(
    name = "kbmigrate",
    version,
    about = "Migrate a Stack Overflow for Teams knowledge base into Confluence"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Crawl the source API into a JSON snapshot")]
    Export(KindArgs),
    #[command(about = "Create a Confluence page for every document in the snapshot")]
    Import(WriteArgs),
    #[command(about = "Upload embedded images and point pages and snapshot at them")]
    Reconcile(WriteArgs),
    #[command(about = "List every external asset URL referenced by the snapshot")]
    Assets(KindArgs),
    #[command(about = "Print the resolved configuration")]
    Config,
}

#[derive(Debug, Args)]
struct KindArgs {
    #[arg(value_name = "questions|articles", value_parser = parse_kind)]
    kind: DocumentKind,
}

#[derive(Debug, Args)]
struct WriteArgs {
    #[arg(value_name = "questions|articles", value_parser = parse_kind)]
    kind: DocumentKind,
    #[arg(long, help = "Report planned changes without writing")]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Export(args)) => run_export(&runtime, args.kind),
        Some(Commands::Import(args)) => run_import(&runtime, args),
        Some(Commands::Reconcile(args)) => run_reconcile(&runtime, args),
        Some(Commands::Assets(args)) => run_assets(&runtime, args.kind),
        Some(Commands::Config) => run_config(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_export(runtime: &RuntimeOptions, kind: DocumentKind) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let snapshot_path = paths.resolve(config.snapshot_path(kind));
    let mut client = SourceClient::connect(SourceClientConfig::from_config(&config, &paths)?)?;
    let mut pacer = ThreadPacer;
    let report = crawl_documents(
        &mut client,
        &mut pacer,
        CrawlSettings::from_pacing(&config.pacing),
        kind,
    )?;
    write_snapshot(&snapshot_path, &report.documents)?;

    println!("export {}", kind.collection());
    println!("snapshot: {}", normalize_path(&snapshot_path));
    println!("listed: {}", report.listed);
    println!("hydrated: {}", report.hydrated);
    println!("dropped: {}", report.dropped);
    println!("omitted_comments: {}", report.omitted_comments);
    println!("retries: {}", client.retry_count());
    println!("request_count: {}", report.request_count);
    print_list("diagnostics", &report.diagnostics);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import(runtime: &RuntimeOptions, args: WriteArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let snapshot_path = paths.resolve(config.snapshot_path(args.kind));
    let documents = read_snapshot(&snapshot_path, args.kind)?;
    let mut client = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config, &paths)?)?;
    let report = mirror_documents(
        &mut client,
        &documents,
        MirrorSettings {
            dry_run: args.dry_run,
        },
    );

    println!("import {}", args.kind.collection());
    println!("snapshot: {}", normalize_path(&snapshot_path));
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("documents: {}", documents.len());
    println!("created: {}", report.created);
    println!("skipped: {}", report.skipped);
    println!("failed: {}", report.failed);
    println!("request_count: {}", report.request_count);
    for page in &report.pages {
        match &page.detail {
            Some(detail) if page.action == "failed" => {
                println!("page.{}: {} ({detail})", page.action, page.title)
            }
            _ => println!("page.{}: {}", page.action, page.title),
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_reconcile(runtime: &RuntimeOptions, args: WriteArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let snapshot_path = paths.resolve(config.snapshot_path(args.kind));
    let asset_dir = paths.resolve(config.asset_dir(args.kind));
    let pattern = AssetPattern::from_config(&config)?;
    let library = LocalAssetLibrary::scan(&asset_dir)?;
    let mut client = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config, &paths)?)?;
    let report = reconcile_snapshot(
        &mut client,
        &snapshot_path,
        args.kind,
        &library,
        &pattern,
        ReconcileOptions {
            dry_run: args.dry_run,
        },
    )?;

    println!("reconcile {}", args.kind.collection());
    println!("snapshot: {}", normalize_path(&snapshot_path));
    println!("asset_dir: {}", normalize_path(&asset_dir));
    println!("asset_domain: {}", pattern.domain());
    println!("local_assets: {}", library.len());
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("scanned: {}", report.scanned);
    println!("pages_updated: {}", report.pages_updated);
    println!("uploaded: {}", report.uploaded);
    println!("reused: {}", report.reused);
    println!("snapshot_changed: {}", format_flag(report.changed));
    println!("request_count: {}", report.request_count);
    for page in &report.pages {
        println!("page.{}: {} ({} rewritten)", page.action, page.title, page.rewritten);
    }
    print_list("unmatched", &report.unmatched);
    print_list("missing_pages", &report.missing_pages);
    let collisions = report
        .collisions
        .iter()
        .map(|collision| format!("{} <- {}", collision.filename, collision.urls.join(", ")))
        .collect::<Vec<_>>();
    print_list("collisions", &collisions);
    print_list("errors", &report.errors);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_assets(runtime: &RuntimeOptions, kind: DocumentKind) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let snapshot_path = paths.resolve(config.snapshot_path(kind));
    let pattern = AssetPattern::from_config(&config)?;
    let documents = read_snapshot(&snapshot_path, kind)?;
    let urls = list_asset_urls(&documents, &pattern);
    let list_path = asset_list_path(&snapshot_path);
    write_asset_url_list(&list_path, &urls)?;

    println!("assets {}", kind.collection());
    println!("snapshot: {}", normalize_path(&snapshot_path));
    println!("asset_domain: {}", pattern.domain());
    println!("urls: {}", urls.len());
    println!("written_to: {}", normalize_path(&list_path));
    for url in &urls {
        println!("url: {url}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_config(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;

    println!("resolved configuration");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("config_exists: {}", format_flag(paths.config_path.exists()));
    println!("source.api_url: {}", display_option(config.source_api_url()));
    println!("source.site: {}", display_option(config.source.site.clone()));
    println!(
        "source.key_file: {}",
        normalize_path(&paths.resolve(&config.source.key_file))
    );
    println!("user_agent: {}", config.user_agent());
    println!(
        "destination.base_url: {}",
        display_option(config.confluence_url())
    );
    println!("destination.space_key: {}", display_option(config.space_key()));
    println!(
        "destination.parent_page_id: {}",
        display_option(config.parent_page_id())
    );
    println!(
        "destination.token_file: {}",
        normalize_path(&paths.resolve(&config.destination.token_file))
    );
    println!("assets.external_domain: {}", display_option(config.asset_domain()));
    println!("assets.path_prefix: {}", config.assets.path_prefix);
    for kind in [DocumentKind::Question, DocumentKind::Article] {
        println!(
            "snapshot.{}: {}",
            kind.collection(),
            normalize_path(&paths.resolve(config.snapshot_path(kind)))
        );
        println!(
            "assets.{}_dir: {}",
            kind.collection(),
            normalize_path(&paths.resolve(config.asset_dir(kind)))
        );
    }
    println!(
        "pacing_ms: page={} document={} comment={} answer={}",
        config.pacing.page_delay_ms,
        config.pacing.document_delay_ms,
        config.pacing.comment_delay_ms,
        config.pacing.answer_delay_ms
    );
    println!(
        "retry: max_retries={} default_backoff_secs={} max_backoff_secs={}",
        config.retry.max_retries, config.retry.default_backoff_secs, config.retry.max_backoff_secs
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, MigrateConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    init_logging();
    let config = load_config(&paths.config_path)
        .with_context(|| format!("failed to load {}", normalize_path(&paths.config_path)))?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

/// Logs go to stderr so report lines on stdout stay machine-readable.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn parse_kind(value: &str) -> Result<DocumentKind, String> {
    DocumentKind::parse(value).map_err(|error| error.to_string())
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{label}:");
    for item in items {
        println!("  - {item}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn display_option(value: Option<String>) -> String {
    value.unwrap_or_else(|| "<unset>".to_string())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
