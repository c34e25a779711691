use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use vdisk_core::{cleanup, cli, commands, errors, logging, output, DiskManager, OutputMode};
use vdisk_hal::{DiskHal, LinuxHal};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let config = match commands::effective_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            logging::init(cli.verbose);
            return report(mode, &err);
        }
    };
    logging::init(config.verbose);

    let hal: Arc<dyn DiskHal> = Arc::new(LinuxHal::new());
    let manager = DiskManager::new(hal, config);
    if let Err(err) = cleanup::install_signal_handler(manager.cleanup().clone()) {
        log::warn!("Could not install signal handler: {}", err);
    }

    let result = commands::run(&manager, &cli.command, &mut std::io::stdout().lock());
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let cleaned = manager.cleanup().run();
            if cleaned > 0 {
                log::warn!("Detached {} image(s) left behind by the failed operation", cleaned);
            }
            report(manager.config().output, &err)
        }
    }
}

fn report(mode: OutputMode, err: &anyhow::Error) -> ExitCode {
    let interactive = std::io::stderr().is_terminal();
    let written = match mode {
        OutputMode::Json => output::write_error(&mut std::io::stdout().lock(), mode, err, false),
        OutputMode::Text => {
            output::write_error(&mut std::io::stderr().lock(), mode, err, interactive)
        }
    };
    if written.is_err() {
        eprintln!("error: {:#}", err);
    }
    ExitCode::from(errors::exit_code(err))
}
