//! Binary entry point for the gbtree administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use gbtree::{
    primitives::io::StdFileSystem,
    storage::btree::meta,
    storage::layout::TestLayout,
    GbTree, GbTreeBuilder, LongLayout, PageCache, PageCacheOptions, TreeOptions,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gbtree",
    version,
    about = "Administrative CLI for generational B+tree files",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, default_value_t = 8192, help = "Page size in bytes")]
    page_size: u32,

    #[arg(long, global = true, default_value_t = 64, help = "Page cache size in MiB")]
    cache_mib: usize,

    #[arg(
        long,
        global = true,
        default_value_t = 0,
        help = "Zero bytes appended to every u64 key"
    )]
    key_padding: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty tree")]
    Create {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    #[command(about = "Print the durable tree state without opening the tree")]
    Info {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    #[command(about = "Open the tree and check its structure")]
    Verify {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    #[command(about = "Print entries in key order")]
    Dump {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, help = "First key to print")]
        from: Option<u64>,

        #[arg(long, help = "Last key to print")]
        to: Option<u64>,
    },

    #[command(about = "Insert seeded synthetic entries")]
    Load {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, default_value_t = 10_000, help = "Number of entries")]
        count: u64,

        #[arg(long, default_value_t = 0, help = "Seed for the key order")]
        seed: u64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct InfoReport {
    path: String,
    page_size: u32,
    layout_identifier: String,
    layout_version: String,
    key_size: u32,
    value_size: u32,
    sequence: u64,
    stable_generation: u64,
    clean_shutdown: bool,
    root: u64,
    root_generation: u64,
    high_water: u64,
    free_pages: u64,
}

#[derive(Serialize)]
struct LoadReport {
    inserted: u64,
    stats: gbtree::storage::btree::TreeStatsSnapshot,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let cache = PageCache::create(
        Arc::new(StdFileSystem),
        PageCacheOptions {
            page_size: cli.open.page_size,
            cache_bytes: cli.open.cache_mib * 1024 * 1024,
            verify_checksums: true,
        },
    )?;
    let layout = LongLayout::with_key_padding(cli.open.key_padding);

    match cli.command {
        Command::Create { path } => {
            open(&cache, &path, layout, true)?.close()?;
            println!("created {}", path.display());
        }
        Command::Info { path } => {
            let report = info(&cache, &path)?;
            emit(&cli.format, &report, || print_info_text(&report))?;
        }
        Command::Verify { path } => {
            let tree = open(&cache, &path, layout, false)?;
            let report = tree.consistency_check()?;
            emit(&cli.format, &report, || {
                println!(
                    "Verify => consistent={} height={} leaves={} internal={} entries={} \
                     free={} trunks={} high_water={} underfull={}",
                    report.is_consistent(),
                    report.height,
                    report.leaf_pages,
                    report.internal_pages,
                    report.entries,
                    report.free_pages,
                    report.trunk_pages,
                    report.high_water,
                    report.underfull_nodes,
                );
                for error in &report.errors {
                    println!("- {error}");
                }
            })?;
            tree.close()?;
            if !report.is_consistent() {
                std::process::exit(2);
            }
        }
        Command::Dump { path, from, to } => {
            let tree = open(&cache, &path, layout, false)?;
            let seeker = tree.seek(&from.unwrap_or(0), &to.unwrap_or(u64::MAX))?;
            for entry in seeker.entries() {
                let (key, value) = entry?;
                println!("{key}\t{value}");
            }
            tree.close()?;
        }
        Command::Load { path, count, seed } => {
            let tree = open(&cache, &path, layout, true)?;
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut writer = tree.writer()?;
            for _ in 0..count {
                let key_seed: u64 = rng.gen_range(0..count.saturating_mul(4).max(1));
                writer.put(&layout.key(key_seed), &layout.value(key_seed))?;
            }
            writer.close()?;
            let report = LoadReport {
                inserted: count,
                stats: tree.stats(),
            };
            tree.close()?;
            emit(&cli.format, &report, || {
                println!(
                    "Loaded {} entries (leaf_splits={} internal_splits={} root_splits={})",
                    report.inserted,
                    report.stats.leaf_splits,
                    report.stats.internal_splits,
                    report.stats.root_splits
                )
            })?;
        }
    }
    cache.close()?;
    Ok(())
}

fn open(
    cache: &PageCache,
    path: &Path,
    layout: LongLayout,
    create: bool,
) -> Result<GbTree<LongLayout>, Box<dyn Error>> {
    let options = TreeOptions {
        create_if_missing: create,
        ..TreeOptions::default()
    };
    Ok(GbTreeBuilder::new(cache, path, layout)
        .with_options(options)
        .build()?)
}

fn info(cache: &PageCache, path: &Path) -> Result<InfoReport, Box<dyn Error>> {
    let file = cache.map(path, false)?;
    let state = meta::read_state(&file)?;
    let identifier = state.layout.identifier.to_be_bytes();
    Ok(InfoReport {
        path: path.display().to_string(),
        page_size: state.page_size,
        layout_identifier: String::from_utf8_lossy(&identifier)
            .trim_end_matches('\0')
            .to_string(),
        layout_version: format!("{}.{}", state.layout.major, state.layout.minor),
        key_size: state.layout.key_size,
        value_size: state.layout.value_size,
        sequence: state.sequence,
        stable_generation: state.stable_generation.0,
        clean_shutdown: state.was_clean(),
        root: state.root.0,
        root_generation: state.root_generation.0,
        high_water: state.high_water,
        free_pages: state.freelist_len,
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_info_text(report: &InfoReport) {
    println!("Tree: {}", report.path);
    println!(
        "  page_size={} layout={} v{} key_size={} value_size={}",
        report.page_size,
        report.layout_identifier,
        report.layout_version,
        report.key_size,
        report.value_size
    );
    println!(
        "  sequence={} stable_generation={} clean_shutdown={}",
        report.sequence, report.stable_generation, report.clean_shutdown
    );
    println!(
        "  root={} root_generation={} high_water={} free_pages={}",
        report.root, report.root_generation, report.high_water, report.free_pages
    );
}
