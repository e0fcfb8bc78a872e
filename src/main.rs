// Tue Jan 13 2026 - Alex

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use log::error;
use repatch::config::{Config, OptLevel, OutputFormat, Syntax, MAX_ACTIONS};
use repatch::csv::CsvLoader;
use repatch::elf::ElfImage;
use repatch::error::{FrontendError, Result};
use repatch::rules::ast::MatchExpr;
use repatch::{Pipeline, PluginRegistry, RuleCompiler};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author = "Alex")]
#[command(version = "0.9.1")]
#[command(about = "Static binary rewriting frontend for x86-64 ELF", long_about = None)]
struct Args {
    /// Instruction matching; one or more precede each --action
    #[arg(short = 'M', long = "match", value_name = "MATCH")]
    match_exprs: Vec<String>,

    /// How instructions matching the preceding --match options are rewritten
    #[arg(short = 'A', long = "action", value_name = "ACTION")]
    action_exprs: Vec<String>,

    /// Backend executable
    #[arg(long, default_value = "./repatch-backend")]
    backend: PathBuf,

    /// Compression level (higher is smaller output, more mappings)
    #[arg(short = 'c', long, default_value_t = 9,
          value_parser = clap::value_parser!(u8).range(0..=9))]
    compression: u8,

    /// Enable per-instruction match tracing
    #[arg(long)]
    debug: bool,

    /// Only patch the .text section up to this address or symbol
    #[arg(long, value_name = "END")]
    end: Option<String>,

    /// Treat the input as an executable even if it looks like a library
    #[arg(long)]
    executable: bool,

    /// Treat the input as a shared library even if it looks like an executable
    #[arg(long)]
    shared: bool,

    /// Output format: binary, json, patch, patch.gz, patch.bz2, patch.xz
    #[arg(long, default_value = "binary", value_name = "FORMAT")]
    format: String,

    /// Suppress warning messages
    #[arg(long = "no-warnings")]
    no_warnings: bool,

    /// Pass an option through to the backend (repeatable)
    #[arg(long = "option", value_name = "OPTION")]
    options: Vec<String>,

    /// Output file
    #[arg(short = 'o', long, default_value = "a.out", value_name = "FILE")]
    output: String,

    /// Only patch the .text section beginning from this address or symbol
    #[arg(long, value_name = "START")]
    start: Option<String>,

    /// Replace patched pages statically
    #[arg(short = 's', long = "static-loader")]
    static_loader: bool,

    /// Skip this many instructions after a disassembler desync
    #[arg(long, value_name = "N",
          value_parser = clap::value_parser!(u64).range(0..=1000))]
    sync: Option<u64>,

    /// Assembly syntax: ATT or intel
    #[arg(long, default_value = "ATT", value_name = "SYNTAX")]
    syntax: String,

    /// Insert a trap at the trampoline entry for this address (repeatable)
    #[arg(long = "trap", value_name = "ADDR")]
    traps: Vec<String>,

    /// Insert a trap at every trampoline entry
    #[arg(long = "trap-all")]
    trap_all: bool,

    /// Optimization level: 0, 1, 2, 3, or s
    #[arg(short = 'O', default_value = "1", value_name = "LEVEL")]
    optimization: String,

    /// Input ELF executable or shared object
    input: PathBuf,
}

fn main() {
    let matches = Args::command().get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    repatch::logging::init(args.debug, args.no_warnings);
    if let Err(e) = run(args, &matches) {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Group each --action with the --match options preceding it, in
/// command-line order.
fn paired_rules(
    args: &Args,
    matches: &ArgMatches,
) -> Result<Vec<(Vec<String>, String)>> {
    let mut entries: Vec<(usize, bool, String)> = Vec::new();
    if let Some(indices) = matches.indices_of("match_exprs") {
        for (index, text) in indices.zip(args.match_exprs.iter()) {
            entries.push((index, false, text.clone()));
        }
    }
    if let Some(indices) = matches.indices_of("action_exprs") {
        for (index, text) in indices.zip(args.action_exprs.iter()) {
            entries.push((index, true, text.clone()));
        }
    }
    entries.sort_by_key(|(index, _, _)| *index);

    let mut rules = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for (_, is_action, text) in entries {
        if is_action {
            if pending.is_empty() {
                return Err(FrontendError::Semantic(
                    "the `--action' or `-A' option must be preceded by one \
                     or more `--match' or `-M' options"
                        .to_string(),
                ));
            }
            rules.push((std::mem::take(&mut pending), text));
        } else {
            pending.push(text);
        }
    }
    if !pending.is_empty() {
        return Err(FrontendError::Semantic(
            "detected extraneous matching option(s) (`--match' or `-M') \
             that are not paired with a corresponding action (`--action' \
             or `-A')"
                .to_string(),
        ));
    }
    Ok(rules)
}

fn parse_trap_addr(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|_| {
        FrontendError::Semantic(format!(
            "bad value \"{}\" for `--trap' option; expected an address",
            text
        ))
    })
}

fn run(args: Args, matches: &ArgMatches) -> Result<()> {
    if args.shared && args.executable {
        return Err(FrontendError::Semantic(
            "both the `--shared' and `--executable' options cannot be used \
             at the same time"
                .to_string(),
        ));
    }
    let format = OutputFormat::from_str(&args.format)?;
    let syntax = Syntax::from_str(&args.syntax)?;
    let opt_level = OptLevel::from_str(&args.optimization)?;
    let traps = args
        .traps
        .iter()
        .map(|t| parse_trap_addr(t))
        .collect::<Result<Vec<u64>>>()?;

    let rules = paired_rules(&args, matches)?;
    if rules.len() > MAX_ACTIONS {
        return Err(FrontendError::Limit(format!(
            "the total number of actions ({}) exceeds the maximum ({})",
            rules.len(),
            MAX_ACTIONS
        )));
    }

    let elf = ElfImage::load(&args.input, 0)?;

    let mut registry = PluginRegistry::new();
    let mut csv = CsvLoader::new();
    let mut compiler = RuleCompiler::new(&elf, &mut registry, &mut csv);
    let mut actions = Vec::new();
    for (match_texts, action_text) in rules {
        let mut expr: Option<MatchExpr> = None;
        for text in match_texts {
            let compiled = compiler.compile_match(&text)?;
            expr = Some(match expr {
                None => compiled,
                Some(prev) => {
                    MatchExpr::And(Box::new(prev), Box::new(compiled))
                }
            });
        }
        let expr = match expr {
            Some(expr) => expr,
            None => continue,
        };
        actions.push(compiler.compile_action(&action_text, expr)?);
    }
    let detail = compiler.detail;

    let config = Config {
        input: args.input,
        output: args.output,
        backend: args.backend,
        format,
        syntax,
        opt_level,
        compression: args.compression,
        sync: args.sync.map(|n| n as usize),
        start: args.start,
        end: args.end,
        executable: args.executable,
        shared: args.shared,
        static_loader: args.static_loader,
        trap_all: args.trap_all,
        traps,
        backend_options: args.options,
        debug: args.debug,
        no_warnings: args.no_warnings,
    };

    Pipeline::new(config, elf, actions, registry, detail)?.run()
}
