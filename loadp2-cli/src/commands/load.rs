//! `load` command: find the P2, send the chain, then optionally script and
//! terminal.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use loadp2::image::chain;
use loadp2::{Interpreter, LoadPlan, LoadSources, LoadStrategy, LoaderStubs, Session, SessionConfig};
use log::warn;
use std::io::{self, BufRead as _};
use std::path::PathBuf;

use crate::commands::{connect, session_config, terminal};
use crate::config::Config;
use crate::{Cli, CliError, LoadArgs, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Session settings for a load: the shared options plus the load flags.
fn load_settings(cli: &Cli, config: &Config, args: &LoadArgs) -> Result<SessionConfig> {
    let mut settings = session_config(cli, config)?;
    settings.strategy = args.mode.map(LoadStrategy::from);
    settings.patch = args.patch;
    if args.no_zero {
        settings.zero_memory = false;
    }
    if args.no_checksum {
        settings.checksum = false;
    }
    if let Some(cycles) = args.extra_cycles {
        settings.extra_cycles = cycles;
    }
    if let Some(address) = args.address {
        settings.default_address = address;
    }
    Ok(settings)
}

fn stub_dir(config: &Config, args: &LoadArgs) -> Option<PathBuf> {
    args.stub_dir.clone().or_else(|| config.load.stub_dir.clone())
}

/// Read every file of the chain and encode the program arguments. Nothing
/// here depends on the strategy, so it all happens before a port is opened.
fn read_sources(settings: &SessionConfig, args: &LoadArgs) -> Result<LoadSources> {
    let entries = chain::parse(&args.files).map_err(|e| CliError::Usage(e.to_string()))?;
    let mut sources = LoadSources::read(&entries, settings)?;
    if !args.args.is_empty() {
        sources = sources.with_args(&args.args)?;
    }
    Ok(sources)
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn wait_for_enter(cli: &Cli) {
    if cli.non_interactive {
        return;
    }
    eprintln!("Press Enter to exit");
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}

/// Load command implementation.
pub(crate) fn cmd_load(cli: &Cli, config: &Config, args: &LoadArgs) -> Result<u8> {
    let settings = load_settings(cli, config, args)?;
    let sources = read_sources(&settings, args)?;

    let stubs = match stub_dir(config, args) {
        Some(dir) => LoaderStubs::from_dir(&dir)
            .with_context(|| format!("Failed to read loader stubs from {}", dir.display()))?,
        None => LoaderStubs::none(),
    };

    // With a forced mode the layout and stub checks also happen before the
    // target is reset.
    let prebuilt = match settings.strategy {
        Some(strategy) => Some(LoadPlan::assemble(
            &sources,
            &settings,
            strategy,
            settings.resolved_clock_mode(strategy),
            &stubs,
        )?),
        None => None,
    };

    ensure_not_interrupted()?;
    let found = connect(cli, config, &settings)?;
    let mut session = Session::new(found.port, settings, Some(found.version));

    let plan = match prebuilt {
        Some(plan) => plan,
        None => LoadPlan::for_session(&session, &sources, &stubs)?,
    }
    .with_himem(args.himem);

    if !cli.quiet {
        eprintln!(
            "{} Loading {} bytes in {} mode",
            style("📦").cyan(),
            plan.total_bytes(),
            style(session.strategy()).cyan()
        );
    }

    let pb = progress_bar(cli.quiet);
    let mut current = String::new();
    let result = session.load(&plan, &mut |name: &str, sent: usize, total: usize| {
        if name != current {
            current = name.to_string();
            pb.set_message(format!("Loading {name}"));
        }
        if total > 0 {
            pb.set_position(u64::try_from(sent * 100 / total).unwrap_or(100));
        }
    });
    match result {
        Ok(()) => pb.finish_with_message("Done"),
        Err(err) => {
            pb.abandon();
            return Err(anyhow::Error::from(err).context("Load failed"));
        },
    }
    if !cli.quiet {
        eprintln!("{} Loaded {}", style("✓").green(), args.files);
    }

    if args.script.is_some() || args.terminal {
        session.enter_user_baud()?;
    }

    if let Some(script) = &args.script {
        let outcome = Interpreter::new().run(session.port_mut(), script);
        match outcome {
            Ok(()) => {},
            Err(err) if args.terminal => warn!("Script stopped: {err}"),
            Err(err) => return Err(anyhow::Error::from(err).context("Script failed")),
        }
    }

    let mut code = 0;
    if args.terminal {
        if let Some(device_code) = terminal::pass_through(session.port_mut(), cli.quiet)? {
            code = device_code;
        }
    }

    if args.wait {
        wait_for_enter(cli);
    }
    session.close()?;
    Ok(code)
}
