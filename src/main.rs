use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use std::fs::File;
use std::io::{self, Write};
use std::ops::Range;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vbuf::{EngineConfig, Line, LineEndingMode, SearchOptions, VirtualBuffer};

/// Lines handled per step of `--replace`
const REPLACE_CHUNK_LINES: usize = 10_000;

/// Inspect and edit large files through the virtual buffer engine
#[derive(Parser, Debug)]
#[command(name = "vbuf")]
#[command(about = "Open a file of any size and print lines, tokens or replacements", long_about = None)]
#[command(version)]
struct Args {
    /// File to open
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Path to configuration file (JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Treat `\r\n` and lone `\r` as line breaks too
    #[arg(long)]
    any_line_endings: bool,

    /// Lines to print, as `N` or `START..END` (0-based, end exclusive)
    #[arg(long, value_name = "RANGE")]
    lines: Option<String>,

    /// Print highlight tokens for each printed line
    #[arg(long)]
    tokens: bool,

    /// Override the syntax language (rust, python, c, generic, plain)
    #[arg(long, value_name = "NAME")]
    language: Option<String>,

    /// Print every match of QUERY as `line:start..end`
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Replace every match of FROM with TO before printing
    #[arg(long, num_args = 2, value_names = ["FROM", "TO"])]
    replace: Option<Vec<String>>,

    /// Match case in --search and --replace
    #[arg(long)]
    case_sensitive: bool,

    /// Treat queries as regular expressions; TO may use `$1` references
    #[arg(long)]
    regex: bool,

    /// Only match whole words
    #[arg(long)]
    whole_word: bool,

    /// Write the resulting text to this file
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Print the configuration JSON Schema and exit
    #[arg(long)]
    schema: bool,
}

fn main() -> AnyhowResult<()> {
    let args = Args::parse();

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();

    if args.schema {
        println!(
            "{}",
            serde_json::to_string_pretty(&EngineConfig::json_schema())?
        );
        return Ok(());
    }

    let config = load_config(&args)?;

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(path) = &args.path else {
        anyhow::bail!("No file given (see --help)");
    };

    let mut buffer = VirtualBuffer::open_with_config(path, &config)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    buffer.on_index_progress(|progress| {
        tracing::debug!(
            "indexed {}/{} bytes, {} lines",
            progress.scanned_bytes,
            progress.total_bytes,
            progress.line_count
        );
    });

    let range = args.lines.as_deref().map(parse_range).transpose()?;

    // Lines up to the end of the requested range are enough, unless the
    // whole text is needed
    if args.replace.is_some() || args.search.is_some() || args.output.is_some() || range.is_none()
    {
        buffer.wait_for_index(None);
    } else if let Some(range) = &range {
        while buffer.line_count() < range.end && !buffer.is_index_finished() {
            buffer.wait_for_index(Some(std::time::Duration::from_millis(20)));
        }
    }
    if let Some(error) = buffer.index_error() {
        anyhow::bail!("Indexing {} failed: {}", path.display(), error);
    }

    eprintln!(
        "{}: {}{} lines, {}, {} language",
        path.display(),
        if buffer.is_index_finished() { "" } else { ">=" },
        buffer.line_count(),
        buffer.encoding(),
        buffer.language().name
    );

    let options = SearchOptions {
        case_sensitive: args.case_sensitive,
        regex: args.regex,
        whole_word: args.whole_word,
        max_matches: None,
    };

    if let Some(query) = &args.search {
        let found = buffer.search(query, &options).context("Search failed")?;
        for hit in &found {
            println!("{}:{}..{}", hit.line + 1, hit.columns.start, hit.columns.end);
        }
        eprintln!("{} match(es)", found.len());
    }

    if let Some(replace) = &args.replace {
        let [from, to] = replace.as_slice() else {
            anyhow::bail!("--replace takes exactly two values");
        };
        let mut job = buffer
            .start_replace_all(from, to, &options, REPLACE_CHUNK_LINES)
            .context("Replace failed")?;
        while job.step().context("Replace failed")? {
            tracing::info!(
                "replaced {} so far, at line {}",
                job.replaced(),
                job.next_line()
            );
        }
        let count = job.finish().context("Replace failed")?;
        eprintln!("{} replacement(s)", count);
    }

    if let Some(output) = &args.output {
        let file = File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        buffer
            .write_to(file)
            .with_context(|| format!("Failed to write {}", output.display()))?;
    }

    let range = range.unwrap_or(0..buffer.line_count());
    print_lines(&mut buffer, range, args.tokens)?;

    buffer.close();
    Ok(())
}

fn load_config(args: &Args) -> AnyhowResult<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.any_line_endings {
        config.index.line_endings = LineEndingMode::Any;
    }
    if let Some(language) = &args.language {
        config.syntax.language = Some(language.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn parse_range(spec: &str) -> AnyhowResult<Range<usize>> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .with_context(|| format!("Invalid line number '{}'", s))
    };
    match spec.split_once("..") {
        Some((start, end)) => {
            let range = parse(start)?..parse(end)?;
            anyhow::ensure!(range.start <= range.end, "Empty line range '{}'", spec);
            Ok(range)
        }
        None => {
            let line = parse(spec)?;
            Ok(line..line + 1)
        }
    }
}

fn print_lines(buffer: &mut VirtualBuffer, range: Range<usize>, tokens: bool) -> AnyhowResult<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for n in range {
        let line = match buffer.get_line(n) {
            Ok(Line::Text(text)) => text,
            Ok(Line::Pending) => {
                writeln!(out, "{:>6}  <pending>", n + 1)?;
                continue;
            }
            Err(e) if !e.is_pending() => {
                tracing::debug!("stopping at line {}: {}", n, e);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(out, "{:>6}  {}", n + 1, line)?;
        if tokens {
            for token in buffer.highlight_tokens(n)? {
                writeln!(
                    out,
                    "        {:?} {:?} {:?}",
                    token.span,
                    token.kind,
                    &line[token.span.clone()]
                )?;
            }
        }
    }
    Ok(())
}
