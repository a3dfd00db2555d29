use clap::Parser;
use miette::Result;
use tflow::cli::{Cli, Commands};
use tflow::core::{Config, Project};

fn main() -> Result<()> {
    // Reset SIGPIPE to default behavior (terminate silently) for proper Unix piping.
    // Without this, piping to `head`, `grep -q`, etc. causes a panic on broken pipe.
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .build(),
        )
    }))?;

    let cli = Cli::parse();
    let global = cli.global;

    let project = match global.project {
        Some(ref path) => Project::discover_from(path).ok(),
        None => Project::discover().ok(),
    };
    let config = Config::load_for(project.as_ref());
    let directive = if global.verbose {
        Some("tflow=debug")
    } else if global.quiet {
        Some("error")
    } else {
        config.log_filter.as_deref()
    };
    tflow::logging::init(directive, config.log_format());

    match cli.command {
        Commands::Init(args) => tflow::cli::commands::init::run(args),
        Commands::Validate(args) => tflow::cli::commands::validate::run(args, &global),
        Commands::Proc(cmd) => tflow::cli::commands::proc::run(cmd, &global),
        Commands::Wo(cmd) => tflow::cli::commands::wo::run(cmd, &global),
        Commands::Part(cmd) => tflow::cli::commands::part::run(cmd, &global),
        Commands::Qa(cmd) => tflow::cli::commands::qa::run(cmd, &global),
        Commands::Sampling(cmd) => tflow::cli::commands::sampling::run(cmd, &global),
        Commands::Completions(args) => tflow::cli::commands::completions::run(args),
    }
}
