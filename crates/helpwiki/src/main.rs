use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use helpwiki_core::archive::{read_extracted_dir, read_toc_order, read_zip_archive};
use helpwiki_core::catalog::Catalog;
use helpwiki_core::config::{HelpwikiConfig, load_config};
use helpwiki_core::confluence::{ConfluenceClient, ConfluenceClientConfig};
use helpwiki_core::convert::convert_standalone;
use helpwiki_core::hierarchy::Forest;
use helpwiki_core::idmap::IdentifierMap;
use helpwiki_core::publish::{
    BuildReport, OutlineReport, PublishOptions, Publisher, SharedUploadReport, derive_title,
};
use helpwiki_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "helpwiki",
    version,
    about = "Convert MSHC/CHM help archives into a Confluence page tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
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
    #[command(about = "Create the .helpwiki/ runtime layout and default config")]
    Init(InitArgs),
    #[command(about = "Print the topic hierarchy of a help source")]
    Tree(SourceArgs),
    #[command(about = "Write a browsable standalone copy of a help source")]
    Convert(ConvertArgs),
    #[command(about = "Create one empty page per topic and record the page ids")]
    Outline(PublishArgs),
    #[command(about = "Fill outlined pages with rewritten topic bodies")]
    Build(PublishArgs),
    #[command(about = "Outline, upload shared assets, then build")]
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(value_name = "SOURCE", help = ".mshc/.zip archive, or a directory with --chm")]
    source: PathBuf,
    #[arg(long, help = "SOURCE is an extracted CHM directory containing index.hhc")]
    chm: bool,
    #[arg(long, value_name = "PREFIX", help = "Id prefix for CHM topics (default: SOURCE name)")]
    id_prefix: Option<String>,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, short, value_name = "DIR")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, value_name = "PATH", help = "Identifier map (default: .helpwiki/maps/<SOURCE>.map.json)")]
    map: Option<PathBuf>,
    #[arg(long, help = "Report what would change without writing to Confluence")]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStage {
    Outline,
    Build,
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Tree(args)) => run_tree(&runtime, args),
        Some(Commands::Convert(args)) => run_convert(&runtime, args),
        Some(Commands::Outline(args)) => run_publish(&runtime, args, PublishStage::Outline),
        Some(Commands::Build(args)) => run_publish(&runtime, args, PublishStage::Build),
        Some(Commands::Publish(args)) => run_publish(&runtime, args, PublishStage::All),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized helpwiki runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("maps_dir: {}", normalize_path(&paths.maps_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_tree(runtime: &RuntimeOptions, args: SourceArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let (catalog, forest) = load_source(&config, &args, PathBuf::new())?;

    for node_id in forest.preorder() {
        let node = forest.node(node_id);
        let title = catalog
            .document(&node.internal_id)
            .map(|record| derive_title(&node.internal_id, &record.metadata))
            .unwrap_or_else(|| node.internal_id.clone());
        println!(
            "{}{}  {}",
            "  ".repeat(forest.depth(node_id)),
            node.internal_id,
            title
        );
    }
    println!("documents: {}", catalog.document_count());
    println!("roots: {}", forest.roots().len());
    println!("assets: {}", catalog.assets().len());
    println!("skipped: {}", catalog.skipped().len());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_convert(runtime: &RuntimeOptions, args: ConvertArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let (catalog, forest) = load_source(&config, &args.source, args.output.clone())?;

    let report = convert_standalone(&catalog, &forest, &args.output)?;
    println!("convert");
    println!("output_root: {}", normalize_path(&report.output_root));
    println!("documents_written: {}", report.documents_written);
    println!("assets_written: {}", report.assets_written);
    println!("index_path: {}", normalize_path(&report.index_path));
    println!("index_entries: {}", report.index_entries);
    println!("skipped: {}", catalog.skipped().len());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_publish(runtime: &RuntimeOptions, args: PublishArgs, stage: PublishStage) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let space_key = config
        .space_key()
        .context("Confluence space is not configured (set [confluence].space_key or CONFLUENCE_SPACE_KEY)")?;
    let (catalog, forest) = load_source(&config, &args.source, PathBuf::new())?;

    let map_path = args
        .map
        .clone()
        .unwrap_or_else(|| paths.default_map_path(&args.source.source));
    let mut id_map = IdentifierMap::load(&map_path)?;
    info!(path = %map_path.display(), entries = id_map.len(), "loaded identifier map");

    let mut client = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config)?)?;
    let options = PublishOptions {
        space_key,
        root_parent_id: config.confluence.parent_page_id.clone(),
        shared_attachment_page_id: config.confluence.shared_attachment_page_id.clone(),
        property_key: config.property_key().to_string(),
        dry_run: args.dry_run,
        checkpoint_path: (config.checkpoint() && !args.dry_run).then(|| map_path.clone()),
    };

    let mut publisher = Publisher::new(&catalog, &forest, &mut id_map, &mut client, options);
    if matches!(stage, PublishStage::Outline | PublishStage::All) {
        let report = publisher.create_outline()?;
        print_outline_report(&report);
    }
    if stage == PublishStage::All {
        let report = publisher.upload_shared_assets()?;
        print_shared_report(&report);
    }
    if matches!(stage, PublishStage::Build | PublishStage::All) {
        let report = publisher.build_all()?;
        print_build_report(&report);
    }

    if !args.dry_run && stage != PublishStage::Build {
        id_map.save(&map_path)?;
    }
    println!("map_path: {}", normalize_path(&map_path));
    println!("map_entries: {}", id_map.len());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_source(
    config: &HelpwikiConfig,
    args: &SourceArgs,
    output_root: PathBuf,
) -> Result<(Catalog, Forest)> {
    let source = args.source.as_path();
    let catalog = if args.chm {
        if !source.is_dir() {
            bail!("--chm expects an extracted CHM directory: {}", source.display());
        }
        let encoding = config.encoding()?;
        let order = read_toc_order(source, encoding)?;
        let entries = read_extracted_dir(source)?;
        let id_prefix = args
            .id_prefix
            .clone()
            .unwrap_or_else(|| source_stem(source));
        Catalog::build(entries, &config.chm_options(output_root, order, &id_prefix)?)?
    } else {
        let entries = read_zip_archive(source)?;
        Catalog::build(entries, &config.mshc_options(output_root)?)?
    };
    let forest = Forest::from_catalog(&catalog)?;
    info!(
        source = %source.display(),
        documents = catalog.document_count(),
        assets = catalog.assets().len(),
        roots = forest.roots().len(),
        "loaded help source"
    );
    Ok((catalog, forest))
}

fn print_outline_report(report: &OutlineReport) {
    println!("outline");
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("created: {}", report.created.len());
    println!("existing: {}", report.existing);
    println!("would_create: {}", report.would_create.len());
    println!("properties_written: {}", report.properties_written);
    println!("properties_existing: {}", report.properties_existing);
    println!("request_count: {}", report.request_count);
    for entry in &report.created {
        println!("  created {} -> {} ({})", entry.internal_id, entry.external_id, entry.title);
    }
}

fn print_shared_report(report: &SharedUploadReport) {
    println!("shared_assets");
    println!(
        "page_id: {}",
        report.page_id.as_deref().unwrap_or("<not configured>")
    );
    println!("uploaded: {}", report.uploaded.len());
    println!("conflicts: {}", report.conflicts.len());
    println!("missing: {}", report.missing.len());
}

fn print_build_report(report: &BuildReport) {
    println!("build");
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("built: {}", report.built);
    println!("missing_outline: {}", report.missing_outline.len());
    let attachments = report
        .pages
        .iter()
        .map(|page| page.attachments_uploaded.len())
        .sum::<usize>();
    let conflicts = report
        .pages
        .iter()
        .map(|page| page.attachment_conflicts.len())
        .sum::<usize>();
    let missing_assets = report
        .pages
        .iter()
        .map(|page| page.missing_assets.len())
        .sum::<usize>();
    let name_collisions = report
        .pages
        .iter()
        .map(|page| page.name_collisions.len())
        .sum::<usize>();
    println!("attachments_uploaded: {attachments}");
    println!("attachment_conflicts: {conflicts}");
    println!("missing_assets: {missing_assets}");
    println!("name_collisions: {name_collisions}");
    println!("request_count: {}", report.request_count);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if !runtime.diagnostics {
        return;
    }
    println!("\n[diagnostics]\n{}", paths.diagnostics());
    let status = inspect_runtime(paths);
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("maps_dir_exists: {}", format_flag(status.maps_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    for warning in status.warnings {
        println!("warning: {warning}");
    }
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

fn source_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "help".to_string())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
