use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use petgraph::dot::Dot;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analysis::control_flow::{
    reachable, Cancellation, ControlFlow, FlowFactory, FlowOptions, FlowPolicy, Instruction,
    Variable,
};
use crate::config::{load_config, PolicyChoice};
use crate::errors::FlowError;
use crate::syntax::{parse_java, Procedure, ProcedureKind, SyntaxRef};

#[derive(Parser, Debug)]
#[command(name = "ctrlflow")]
#[command(about = "Control flow graphs of Java procedure bodies", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to the nearest .ctrlflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of parallel jobs (0 = use all cores)
    #[arg(short = 'j', long, global = true, default_value = "0")]
    pub jobs: usize,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Flags shared by every command that builds flows.
#[derive(clap::Args, Debug, Clone)]
pub struct FlowArgs {
    /// Java source files
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Only procedures with this name (simple or qualified)
    #[arg(short, long)]
    pub method: Option<String>,

    /// Keep branches on constant conditions
    #[arg(long)]
    pub no_fold: bool,

    /// Which variables to record
    #[arg(long, value_enum)]
    pub policy: Option<PolicyChoice>,

    /// Model an exception edge after every tracked write inside a try
    #[arg(long)]
    pub exceptions_after_assignment: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the control flow of each procedure
    Dump {
        #[command(flatten)]
        flow: FlowArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: DumpFormat,
    },
    /// Report instructions no execution can reach
    Reach {
        #[command(flatten)]
        flow: FlowArgs,
    },
    /// List the procedures found in each file
    List {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DumpFormat {
    Text,
    Json,
    Dot,
}

/// Effective build settings after merging config file and flags.
#[derive(Clone, Copy)]
struct Settings {
    options: FlowOptions,
    policy: &'static dyn FlowPolicy,
}

fn settings(config: Option<&Path>, args: &FlowArgs) -> Result<Settings> {
    let config = load_config(config)?;
    let mut options = config.options;
    if args.no_fold {
        options = options.with_folding(false);
    }
    if args.exceptions_after_assignment {
        options = options.with_exceptions_after_assignment(true);
    }
    let policy = args.policy.unwrap_or(config.policy.variables).policy();
    debug!(?options, policy = policy.key(), "Effective flow settings");
    Ok(Settings { options, policy })
}

pub fn configure_thread_pool(jobs: usize) {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if jobs > 0 {
        builder = builder.num_threads(jobs);
    }
    if let Err(e) = builder.build_global() {
        debug!("Thread pool already configured: {e}");
    }
}

#[derive(Debug, Serialize)]
pub struct InstructionRow {
    pub index: usize,
    pub text: String,
    pub instruction: Instruction,
    pub owner: Option<SyntaxRef>,
}

/// Everything reported about one procedure.
#[derive(Debug, Serialize)]
pub struct FlowReport {
    pub file: PathBuf,
    pub procedure: String,
    pub kind: ProcedureKind,
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub instructions: Vec<InstructionRow>,
    pub variables: Vec<Variable>,
    pub constant_condition_occurred: bool,
    pub exit_reachable: bool,
    pub unreachable: Vec<usize>,
    #[serde(skip)]
    dot: Option<String>,
}

impl FlowReport {
    fn new(file: &Path, procedure: &Procedure<'_>) -> Self {
        Self {
            file: file.to_path_buf(),
            procedure: procedure.name.clone(),
            kind: procedure.kind,
            line: procedure.node.start_position().row + 1,
            error: None,
            instructions: Vec::new(),
            variables: Vec::new(),
            constant_condition_occurred: false,
            exit_reachable: true,
            unreachable: Vec::new(),
            dot: None,
        }
    }

    fn fill(&mut self, flow: &ControlFlow, with_dot: bool) {
        self.instructions = flow
            .instructions()
            .enumerate()
            .map(|(index, instruction)| InstructionRow {
                index,
                text: flow.render(index),
                instruction,
                owner: flow.owner_of(index),
            })
            .collect();
        self.variables = flow.variables().to_vec();
        self.constant_condition_occurred = flow.constant_condition_occurred();
        let reach = reachable(flow);
        self.exit_reachable = reach.exit_reachable();
        self.unreachable = reach.unreachable().collect();
        if with_dot {
            self.dot = Some(format!("{}", Dot::new(&flow.to_graph())));
        }
    }
}

fn selected(procedure: &Procedure<'_>, filter: Option<&str>) -> bool {
    filter.is_none_or(|name| {
        procedure.name == name || procedure.name.rsplit('.').next() == Some(name)
    })
}

/// Build reports for every selected procedure of one file.
///
/// Node identities are only meaningful while their tree is alive, so each
/// file gets its own factory.
pub fn analyze_file(
    path: &Path,
    filter: Option<&str>,
    options: FlowOptions,
    policy: &dyn FlowPolicy,
    with_dot: bool,
) -> Result<Vec<FlowReport>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let source = parse_java(&content)?;
    if source.has_parse_errors() {
        debug!(file = %path.display(), "File has parse errors; affected procedures are skipped");
    }

    let factory = FlowFactory::new();
    let cancellation = Cancellation::new();
    let mut reports = Vec::new();
    for procedure in source.procedures() {
        if !selected(&procedure, filter) {
            continue;
        }
        let mut report = FlowReport::new(path, &procedure);
        match factory.get_control_flow(
            procedure.node,
            source.bytes(),
            policy,
            options,
            0,
            &cancellation,
        ) {
            Ok(flow) => report.fill(&flow, with_dot),
            Err(e @ FlowError::IncompleteCode { .. }) => {
                info!(procedure = %procedure.name, "Skipping: {e}");
                report.error = Some(e.to_string());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to build {}", procedure.name)),
        }
        reports.push(report);
    }
    debug!(file = %path.display(), stats = ?factory.stats(), "Finished file");
    Ok(reports)
}

fn analyze_all(args: &FlowArgs, settings: Settings, with_dot: bool) -> Result<Vec<FlowReport>> {
    let per_file: Vec<Result<Vec<FlowReport>>> = args
        .files
        .par_iter()
        .map(|path| {
            analyze_file(
                path,
                args.method.as_deref(),
                settings.options,
                settings.policy,
                with_dot,
            )
        })
        .collect();
    let mut reports = Vec::new();
    for result in per_file {
        reports.extend(result?);
    }
    if reports.is_empty() {
        warn!("No matching procedures found");
    }
    Ok(reports)
}

pub fn render_text(reports: &[FlowReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let _ = writeln!(
            out,
            "== {} ({}:{}) ==",
            report.procedure,
            report.file.display(),
            report.line
        );
        if let Some(error) = &report.error {
            let _ = writeln!(out, "  skipped: {error}");
            continue;
        }
        let unreachable: HashSet<usize> = report.unreachable.iter().copied().collect();
        for row in &report.instructions {
            let marker = if unreachable.contains(&row.index) {
                "  (unreachable)"
            } else {
                ""
            };
            let _ = writeln!(out, "{:>4}: {}{marker}", row.index, row.text);
        }
    }
    out
}

pub fn render_reachability(reports: &[FlowReport]) -> String {
    let mut out = String::new();
    for report in reports.iter().filter(|r| r.error.is_none()) {
        let exit = if report.exit_reachable {
            "completes"
        } else {
            "never completes"
        };
        let _ = writeln!(out, "{}: {exit}", report.procedure);
        for index in &report.unreachable {
            let row = &report.instructions[*index];
            let line = row.owner.map_or(report.line, |owner| owner.line);
            let _ = writeln!(
                out,
                "  {}:{line}: unreachable {}",
                report.file.display(),
                row.text
            );
        }
    }
    out
}

pub fn run(cli: Cli) -> Result<()> {
    configure_thread_pool(cli.jobs);
    match cli.command {
        Commands::Dump { flow, format } => {
            let settings = settings(cli.config.as_deref(), &flow)?;
            let reports = analyze_all(&flow, settings, format == DumpFormat::Dot)?;
            match format {
                DumpFormat::Text => print!("{}", render_text(&reports)),
                DumpFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
                DumpFormat::Dot => {
                    for dot in reports.iter().filter_map(|r| r.dot.as_deref()) {
                        println!("{dot}");
                    }
                }
            }
        }
        Commands::Reach { flow } => {
            let settings = settings(cli.config.as_deref(), &flow)?;
            let reports = analyze_all(&flow, settings, false)?;
            print!("{}", render_reachability(&reports));
        }
        Commands::List { files } => {
            for path in files {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let source = parse_java(&content)?;
                for procedure in source.procedures() {
                    println!(
                        "{}:{}: {}",
                        path.display(),
                        procedure.node.start_position().row + 1,
                        procedure.name
                    );
                }
            }
        }
    }
    Ok(())
}
