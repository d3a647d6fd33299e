use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{debug, info, warn};
use taskpaper::projectors::{outline_projector, tag_projector};
use taskpaper::storage::{FsLoader, LoadOptions, LoadedDocument, TaskPaperLoader};

const EXTENSION: &str = "taskpaper";

#[derive(Debug, Parser)]
#[command(
    name = "taskpaper",
    about = "Inspect TaskPaper outlines built with the taskpaper crate",
    version
)]
struct Cli {
    /// Enable debug logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    /// Rewrite CRLF and CR line endings to LF before parsing.
    #[arg(long, global = true)]
    normalize: bool,
    /// Refuse input files larger than this many bytes.
    #[arg(long, global = true)]
    max_bytes: Option<u64>,
    /// JSON file with loader options; flags override it.
    #[arg(long, global = true)]
    options: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse TaskPaper files and print their outline.
    Parse(ParseArgs),

    /// List every tag with the items that carry it.
    Tags(TagsArgs),

    /// Find items carrying a tag.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// TaskPaper files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of an indented listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TagsArgs {
    /// TaskPaper files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// TaskPaper files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Tag name to look for (case-insensitive, without `@`).
    #[arg(long)]
    tag: String,
    /// Only match tags with exactly this value.
    #[arg(long)]
    value: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;
    let options = resolve_load_options(cli.options.as_deref(), cli.normalize, cli.max_bytes)?;
    let loader = FsLoader::new(options);
    match cli.command {
        Commands::Parse(args) => handle_parse(&loader, args),
        Commands::Tags(args) => handle_tags(&loader, args),
        Commands::Search(args) => handle_search(&loader, args),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let logger = if verbose {
        Logger::try_with_str("debug")?
    } else {
        Logger::try_with_env_or_str("warn")?
    };
    logger
        .log_to_stderr()
        .start()
        .context("starting logger")
}

fn resolve_load_options(
    path: Option<&Path>,
    normalize: bool,
    max_bytes: Option<u64>,
) -> Result<LoadOptions> {
    let mut options = match path {
        Some(path) => LoadOptions::from_json_file(path)?,
        None => LoadOptions::default(),
    };
    if normalize {
        options.parse.normalize_line_endings = true;
    }
    if max_bytes.is_some() {
        options.max_input_bytes = max_bytes;
    }
    debug!(
        "event=options module=cli normalize={} max_bytes={:?}",
        options.parse.normalize_line_endings, options.max_input_bytes
    );
    Ok(options)
}

fn load_all(loader: &impl TaskPaperLoader, inputs: &[PathBuf]) -> Result<Vec<LoadedDocument>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no .{EXTENSION} files found in the provided inputs");
    }
    expanded
        .iter()
        .map(|path| {
            loader
                .load_file(path)
                .with_context(|| format!("parsing {:?}", path))
        })
        .collect()
}

fn print_header(loaded: &LoadedDocument, total: usize) {
    if total > 1 {
        println!("== {} ==", loaded.path.display());
    }
}

fn handle_parse(loader: &impl TaskPaperLoader, args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let loaded = load_all(loader, &inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput {
            path: String,
            items: Vec<outline_projector::OutlineNode>,
        }

        let payload: Vec<JsonOutput> = loaded
            .iter()
            .map(|l| JsonOutput {
                path: l.path.display().to_string(),
                items: outline_projector::project_document(&l.document),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for l in &loaded {
            print_header(l, loaded.len());
            print!("{}", outline_projector::render_text(&l.document));
        }
    }
    Ok(())
}

fn handle_tags(loader: &impl TaskPaperLoader, args: TagsArgs) -> Result<()> {
    let TagsArgs { inputs, json } = args;
    let loaded = load_all(loader, &inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput {
            path: String,
            tags: indexmap::IndexMap<String, Vec<tag_projector::TagOccurrence>>,
        }

        let payload: Vec<JsonOutput> = loaded
            .iter()
            .map(|l| JsonOutput {
                path: l.path.display().to_string(),
                tags: tag_projector::tag_index(&l.document),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for l in &loaded {
        print_header(l, loaded.len());
        for (name, occurrences) in tag_projector::tag_index(&l.document) {
            println!("@{name} ({})", occurrences.len());
            for occ in occurrences {
                let value = occ.value.map(|v| format!("({v})")).unwrap_or_default();
                println!("  {:>4}  {}{}  {}", occ.line + 1, occ.name, value, occ.text);
            }
        }
    }
    Ok(())
}

fn handle_search(loader: &impl TaskPaperLoader, args: SearchArgs) -> Result<()> {
    let SearchArgs { inputs, tag, value } = args;
    let tag = tag.trim_start_matches('@');
    let loaded = load_all(loader, &inputs)?;

    let mut hits = 0;
    for l in &loaded {
        for item in tag_projector::items_with_tag(&l.document, tag, value.as_deref()) {
            hits += 1;
            println!(
                "{}:{}: {} {}",
                l.path.display(),
                item.line() + 1,
                item.kind(),
                l.document.content(item.id())
            );
        }
    }
    if hits == 0 {
        warn!("event=search module=cli status=empty tag={tag}");
        eprintln!("No items tagged @{tag}.");
    }
    Ok(())
}

/* ------------------------------ Inputs ------------------------------ */

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("event=scan_dir module=cli path={:?}", canonical);
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut BTreeSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            // Explicit files are taken whatever their extension.
            if visited.insert(canonical.clone()) {
                debug!("event=add_file module=cli path={:?}", canonical);
                out.push(canonical);
            }
        }
    }
    info!("event=expand_inputs module=cli files={}", out.len());
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, seen: &mut BTreeSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !seen.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, seen)?;
        }
    } else if metadata.is_file()
        && canonical
            .extension()
            .map(|ext| ext == EXTENSION)
            .unwrap_or(false)
    {
        out.push(canonical);
    }
    Ok(())
}
