//! Command line tool to validate grammars, compile them into a registry dump and look at the
//! tokens they produce.
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tintex::Registry;

#[derive(Parser, Debug)]
#[command(name = "tintex", version, about = "TextMate grammar tokenizer")]
struct Args {
    /// Lets a grammar include rules from another one, eg `source.soql=source.apex`
    #[arg(long = "allow", value_name = "GRAMMAR=DEPENDENCY", value_parser = parse_allow, global = true)]
    allow: Vec<(String, String)>,

    /// More logs: -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Loads and validates grammars
    Check {
        #[arg(required = true)]
        grammars: Vec<PathBuf>,
    },
    /// Validates grammars and writes the linked registry
    Compile {
        #[arg(required = true)]
        grammars: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Binary)]
        format: Format,
    },
    /// Prints the tokens of each line of a file
    Tokenize {
        #[arg(required = true)]
        grammars: Vec<PathBuf>,
        /// Name or scope name of the grammar to use, detected from the file otherwise
        #[arg(long)]
        lang: Option<String>,
        /// The file to tokenize, after the grammars
        #[arg(required = true)]
        file: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    /// bitcode + zstd
    Binary,
}

fn parse_allow(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((grammar, dependency)) if !grammar.is_empty() && !dependency.is_empty() => {
            Ok((grammar.to_owned(), dependency.to_owned()))
        }
        _ => Err(format!("expected GRAMMAR=DEPENDENCY, got {value:?}")),
    }
}

fn load_registry(
    grammars: &[PathBuf],
    allow: &[(String, String)],
) -> Result<Registry, Box<dyn std::error::Error>> {
    let mut registry = Registry::default();
    for path in grammars {
        registry
            .add_grammar_from_path(path)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        log::info!("Loaded {}", path.display());
    }
    for (grammar, dependency) in allow {
        registry.allow_include(grammar, dependency);
    }
    registry.link_grammars()?;
    Ok(registry)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Check { grammars } => {
            let registry = load_registry(&grammars, &args.allow)?;
            for name in registry.grammar_names() {
                println!("✓ {name}");
            }
        }
        Command::Compile {
            grammars,
            output,
            format,
        } => {
            let registry = load_registry(&grammars, &args.allow)?;
            match format {
                Format::Json => fs::write(&output, registry.dump_to_json()?)?,
                Format::Binary => registry.dump_to_file(&output)?,
            }
            println!("Wrote {}", output.display());
        }
        Command::Tokenize {
            grammars,
            lang,
            file,
        } => {
            let registry = load_registry(&grammars, &args.allow)?;
            let content = fs::read_to_string(&file)?;
            let file_name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let lang = match lang {
                Some(lang) => lang,
                None => registry
                    .detect_grammar(file_name, content.lines().next())
                    .ok_or_else(|| format!("No grammar found for {}, use --lang", file.display()))?
                    .to_owned(),
            };

            let lines = registry.tokenize(&lang, &content)?;
            let content = content.replace("\r\n", "\n").replace('\r', "\n");
            for (i, (line, tokens)) in content.split('\n').zip(&lines).enumerate() {
                println!("{}: {line:?}", i + 1);
                for token in tokens {
                    let scopes: Vec<_> = token.scopes.iter().map(|s| s.as_str()).collect();
                    println!(
                        "  [{}..{}] {:?} {}",
                        token.span.start,
                        token.span.end,
                        &line[token.span.clone()],
                        scopes.join(" ")
                    );
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {e}");
            ExitCode::FAILURE
        }
    }
}
