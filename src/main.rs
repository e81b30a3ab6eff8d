use std::{
    io::{BufWriter, IsTerminal},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use tracing::{Level, error, instrument, trace};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use plugman_cli::cli::{CliCommand, CliContext, CommandOutput, OutputKind};
use plugman_lib::config::{CONFIG_FILE_NAME, PROJECT_CONFIG_DIR};

#[derive(Debug, Clone, Parser)]
#[clap(
    name = "plugman",
    about,
    version,
    arg_required_else_help = true,
    disable_help_subcommand = true,
    color = clap::ColorChoice::Auto
)]
struct Cli {
    #[clap(
        short = 'o',
        long = "output",
        default_value = "text",
        help = "Specify output format (text or json)",
        global = true
    )]
    output: OutputKind,

    #[clap(
        short = 'l',
        long = "log-level",
        default_value_t = Level::INFO,
        help = "Set the log level (trace, debug, info, warn, error)",
        global = true
    )]
    log_level: Level,

    #[clap(long = "verbose", help = "Enable verbose output", global = true)]
    verbose: bool,

    #[clap(
        long = "non-interactive",
        help = "Run in non-interactive mode, declining every prompt. Automatically enabled when stdin is not a TTY",
        global = true
    )]
    non_interactive: bool,

    #[clap(
        long = "user-config",
        help = "Path to user configuration file.",
        global = true
    )]
    user_config: Option<PathBuf>,

    /// Path to the project directory, defaults to the closest directory holding a project config
    #[clap(short = 'C', global = true)]
    project_path: Option<PathBuf>,

    #[clap(subcommand)]
    command: PlugmanCliCommand,
}

/// The main CLI commands for plugman
#[derive(Debug, Clone, Subcommand)]
enum PlugmanCliCommand {
    /// View and initialize configuration for plugman
    #[clap(name = "config", subcommand)]
    Config(plugman_cli::cli::config::ConfigCommand),
    /// Manage workspace plugins
    #[clap(name = "plugin", subcommand)]
    Plugin(plugman_cli::cli::plugin::PluginCommand),
    /// Manage plugin registries
    #[clap(name = "registry", subcommand)]
    Registry(plugman_cli::cli::registry::RegistryCommand),
}

impl CliCommand for PlugmanCliCommand {
    #[instrument(level = "debug", skip_all, name = "plugman")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            PlugmanCliCommand::Config(cmd) => cmd.handle(ctx).await,
            PlugmanCliCommand::Plugin(cmd) => cmd.handle(ctx).await,
            PlugmanCliCommand::Registry(cmd) => cmd.handle(ctx).await,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Auto-detect non-interactive mode if stdin is not a TTY or flag is set
    let non_interactive = cli.non_interactive || !std::io::stdin().is_terminal();

    let (mut stdout, mut stderr) = (Box::new(std::io::stdout()), Box::new(std::io::stderr()));

    if let Err(e) = initialize_tracing(cli.log_level, !non_interactive, cli.verbose) {
        exit_with_output(
            &mut stderr,
            CommandOutput::error(format!("failed to initialize tracing: {e:?}"), None)
                .with_output_kind(cli.output),
        );
    }

    let project_path = cli.project_path.clone().unwrap_or_else(find_project_root);
    if !project_path.exists() {
        exit_with_output(
            &mut stderr,
            CommandOutput::error(format!("{project_path:?} does not exist"), None)
                .with_output_kind(cli.output),
        );
    }

    let mut ctx_builder = CliContext::builder()
        .non_interactive(non_interactive)
        .show_progress(!non_interactive && cli.output == OutputKind::Text)
        .project_dir(project_path);

    if let Some(config_path) = &cli.user_config {
        ctx_builder = ctx_builder.user_config(config_path);
    }

    let ctx = match ctx_builder.build().await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = ?e, "failed to infer global context");
            exit_with_output(
                &mut stdout,
                CommandOutput::error(format!("{e:?}"), None).with_output_kind(cli.output),
            );
        }
    };
    trace!(ctx = ?ctx, "inferred global context");

    // Use a buffered writer to prevent broken pipe errors
    let mut stdout_buf = BufWriter::new(stdout);

    let command_output = run_command(ctx, cli.command).await;

    exit_with_output(
        &mut stdout_buf,
        command_output
            .unwrap_or_else(|e| {
                // NOTE: `{e:?}` prints the whole anyhow context chain
                CommandOutput::error(format!("{e:?}"), None)
            })
            .with_output_kind(cli.output),
    )
}

/// Helper function to execute a command that impl's [`CliCommand`], returning the output
async fn run_command<C>(ctx: CliContext, command: C) -> anyhow::Result<CommandOutput>
where
    C: CliCommand + std::fmt::Debug,
{
    trace!(command = ?command, "handling command");
    command.handle(&ctx).await
}

/// Install the stderr log layer. `RUST_LOG` wins over `log_level` when set.
fn initialize_tracing(log_level: Level, ansi_colors: bool, verbose: bool) -> anyhow::Result<()> {
    let mut fmt_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    if !verbose {
        // reqwest connection pooling is noisy below warn
        fmt_filter = fmt_filter
            .add_directive("hyper=warn".parse()?)
            .add_directive("reqwest=warn".parse()?);
    }

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(verbose)
        .with_thread_ids(verbose)
        .with_thread_names(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_ansi(ansi_colors)
        .with_filter(fmt_filter);

    Registry::default().with(fmt_layer).try_init()?;
    Ok(())
}

/// Helper function to ensure that we're exiting the program consistently and with the correct output format.
#[allow(clippy::expect_used)] // Panicking on stdout failure during exit is acceptable
fn exit_with_output(stdout: &mut impl std::io::Write, output: CommandOutput) -> ! {
    let (message, success) = output.render();
    writeln!(stdout, "{message}").expect("failed to write output to stdout");
    stdout.flush().expect("failed to flush stdout");
    if success {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

fn find_project_root() -> PathBuf {
    let fallback = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut current_dir = match fallback.canonicalize() {
        Ok(dir) => dir,
        Err(_) => return fallback,
    };

    loop {
        // A project is marked by .plugman/config.json, not just the .plugman/ directory
        let project_config = current_dir.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME);
        if project_config.exists() {
            return current_dir;
        }

        if let Some(parent) = current_dir.parent() {
            current_dir = parent.to_path_buf();
        } else {
            break;
        }
    }

    fallback
}
