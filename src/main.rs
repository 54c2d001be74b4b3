use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use chrono::Utc;
use clap::{Arg, ArgAction, ArgMatches, Command, CommandFactory, FromArgMatches, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use runem::config::{load_config, OptionConfig};
use runem::console::Console;
use runem::registry::JobRegistry;
use runem::report::ReportStyle;
use runem::runner::{RunRequest, RunSettings, Runner};
use runem::shutdown::install_shutdown_handler;
use runem::RunemError;

#[derive(Parser, Debug)]
#[command(name = "runem")]
#[command(version)]
#[command(about = "Runs a project's lint, format and test jobs in phases, as fast as possible")]
struct Args {
    /// Job names to run. Other filters further reduce this list [default: all jobs]
    #[arg(long, num_args = 1.., value_name = "JOB")]
    jobs: Option<Vec<String>>,

    /// Job names NOT to run
    #[arg(long = "not-jobs", num_args = 1.., value_name = "JOB")]
    not_jobs: Vec<String>,

    /// Phases to run, in the order given [default: the config's phase order]
    #[arg(long, num_args = 1.., value_name = "PHASE")]
    phases: Option<Vec<String>>,

    /// Phases NOT to run. Does not change the run order
    #[arg(long = "not-phases", num_args = 1.., value_name = "PHASE")]
    not_phases: Vec<String>,

    /// Only run jobs with at least one of these tags [default: all tags]
    #[arg(long, num_args = 1.., value_name = "TAG")]
    tags: Option<Vec<String>>,

    /// Skip jobs with any of these tags
    #[arg(long = "not-tags", num_args = 1.., value_name = "TAG")]
    not_tags: Vec<String>,

    /// Number of jobs to run at once, -1 uses every core
    #[arg(long, short = 'j', default_value_t = -1, allow_negative_numbers = true)]
    procs: i64,

    /// Directory jobs run relative to [default: the directory holding .runem.yml]
    #[arg(long)]
    root: Option<PathBuf>,

    /// Print job progress and tool output
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Show a live spinner while phases run [default: on for terminals]
    #[arg(long, overrides_with = "no_spinner")]
    spinner: bool,

    /// Disable the live spinner
    #[arg(long = "no-spinner")]
    no_spinner: bool,

    /// How to draw the timing report
    #[arg(long, value_enum, default_value = "bars")]
    report_style: StyleArg,

    /// Also write a JSON run summary to this path
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StyleArg {
    Bars,
    Plain,
}

impl From<StyleArg> for ReportStyle {
    fn from(style: StyleArg) -> Self {
        match style {
            StyleArg::Bars => ReportStyle::Bars,
            StyleArg::Plain => ReportStyle::Plain,
        }
    }
}

fn switch_name(name: &str) -> String {
    name.replace(['_', ' '], "-")
}

fn on_id(option: &OptionConfig) -> String {
    format!("option-on:{}", option.name)
}

fn off_id(option: &OptionConfig) -> String {
    format!("option-off:{}", option.name)
}

/// Add `--<option>` and `--no-<option>` for every configured option.
fn with_option_switches(mut cmd: Command, options: &[OptionConfig]) -> Command {
    for option in options {
        let switch = switch_name(&option.name);
        let mut on = Arg::new(on_id(option))
            .long(switch.clone())
            .action(ArgAction::SetTrue)
            .help_heading("Job options");
        let mut off = Arg::new(off_id(option))
            .long(format!("no-{}", switch))
            .action(ArgAction::SetTrue)
            .help_heading("Job options");
        if let Some(desc) = &option.desc {
            on = on.help(desc.clone());
            off = off.help(format!("turn off {}", desc));
        }
        for alias in &option.aliases {
            let mut chars = alias.chars();
            match (chars.next(), chars.next()) {
                (Some(short), None) => on = on.short(short),
                _ => on = on.visible_alias(switch_name(alias)),
            }
            off = off.visible_alias(format!("no-{}", switch_name(alias)));
        }
        cmd = cmd.arg(on).arg(off);
    }
    cmd
}

fn chosen_options(matches: &ArgMatches, options: &[OptionConfig], id: fn(&OptionConfig) -> String) -> Vec<String> {
    options
        .iter()
        .filter(|o| matches.get_flag(&id(o)))
        .map(|o| o.name.clone())
        .collect()
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(console: Console) -> Result<ExitCode, RunemError> {
    // config loading and argument parsing count towards `pre-build`
    let started = Instant::now();
    let started_at = Utc::now();
    let cwd = std::env::current_dir()?;
    // Only inline `command:` jobs and hooks are runnable from the binary.
    let registry = JobRegistry::new();
    let config = load_config(&cwd, &registry)?;

    let cmd = with_option_switches(Args::command(), &config.options_config);
    let matches = cmd.get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    if args.verbose {
        console.log(format!("loaded config from {}", config.cfg_filepath.display()));
    }

    let request = RunRequest {
        jobs: args.jobs,
        not_jobs: args.not_jobs,
        tags: args.tags,
        not_tags: args.not_tags,
        phases: args.phases,
        not_phases: args.not_phases,
        options_on: chosen_options(&matches, &config.options_config, on_id),
        options_off: chosen_options(&matches, &config.options_config, off_id),
        verbose: args.verbose,
    };
    let selection = request.selection(&config)?;
    let options = request.options(&config);

    let root = args.root.unwrap_or_else(|| config.root_dir());
    let mut settings = RunSettings::new(selection, options, root).timed_from(started, started_at);
    settings.procs = args.procs;
    settings.show_progress = if args.no_spinner {
        false
    } else {
        args.spinner || std::io::stdout().is_terminal()
    };
    settings.report_style = args.report_style.into();
    settings.report_json = args.report_json;

    let runner = Runner::new(config, registry, console).with_shutdown(install_shutdown_handler());
    let outcome = runner.run(&settings).await?;
    match outcome.into_result() {
        Ok(_) => Ok(ExitCode::SUCCESS),
        // already reported with the timing report
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let verbose = std::env::args().any(|a| a == "-v" || a == "--verbose");
    init_tracing(verbose);

    let console = Console::stdout();
    match run(console.clone()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "runem failed");
            console.log(format!("ERROR: {}", e));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(name: &str, aliases: &[&str]) -> OptionConfig {
        OptionConfig {
            name: name.to_string(),
            default: false,
            desc: Some("do a thing".to_string()),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn parse(options: &[OptionConfig], argv: &[&str]) -> (Args, ArgMatches) {
        let matches = with_option_switches(Args::command(), options)
            .try_get_matches_from(argv)
            .unwrap();
        (Args::from_arg_matches(&matches).unwrap(), matches)
    }

    #[test]
    fn cli_definition_is_valid() {
        with_option_switches(Args::command(), &[option("fix", &["f"])]).debug_assert();
    }

    #[test]
    fn defaults() {
        let (args, _) = parse(&[], &["runem"]);
        assert_eq!(args.procs, -1);
        assert!(args.jobs.is_none());
        assert!(args.not_tags.is_empty());
        assert!(!args.verbose);
    }

    #[test]
    fn filters_take_several_values() {
        let (args, _) = parse(
            &[],
            &["runem", "--phases", "test", "edit", "--not-tags", "slow", "-j", "2"],
        );
        assert_eq!(args.phases, Some(vec!["test".into(), "edit".into()]));
        assert_eq!(args.not_tags, vec!["slow".to_string()]);
        assert_eq!(args.procs, 2);
    }

    #[test]
    fn option_switches_and_aliases() {
        let options = [option("unit_test", &["u", "tests"]), option("fix", &[])];
        let (_, matches) = parse(&options, &["runem", "-u", "--no-fix"]);
        assert_eq!(chosen_options(&matches, &options, on_id), vec!["unit_test"]);
        assert_eq!(chosen_options(&matches, &options, off_id), vec!["fix"]);

        let (_, matches) = parse(&options, &["runem", "--no-tests"]);
        assert_eq!(chosen_options(&matches, &options, off_id), vec!["unit_test"]);

        let (_, matches) = parse(&options, &["runem", "--unit-test"]);
        assert_eq!(chosen_options(&matches, &options, on_id), vec!["unit_test"]);
    }
}
