mod cli;
mod logging;

use std::{process::ExitCode, thread};

use clap::Parser;
use speechctl::{
    cancel::CancelToken,
    error::{ExitClass, InstallError},
};
use tracing::warn;

use cli::{Cli, Completion};

/// `check` found a broken install.
const UNHEALTHY_EXIT: u8 = 4;

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
        .map_or(ExitClass::Internal, InstallError::exit_class)
        .code()
}

/// First Ctrl-C cancels the run so staging is cleaned up; a second one exits.
fn watch_interrupts(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("speechctl-signal".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!("interrupt handling unavailable: {err}");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("interrupted; cleaning up (press Ctrl-C again to abort)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(i32::from(ExitClass::Cancelled.code()));
                }
            });
        });
    if let Err(err) = spawned {
        warn!("failed to spawn interrupt watcher: {err}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(cli.verbose) {
        eprintln!("speechctl: {err}");
        return ExitCode::from(ExitClass::Usage.code());
    }

    let json = cli.command.json();
    let cancel = cli.command.cancel_token();
    watch_interrupts(cancel.clone());

    match cli::run(cli.command, &cancel) {
        Ok(Completion::Success) => ExitCode::SUCCESS,
        Ok(Completion::Unhealthy) => ExitCode::from(UNHEALTHY_EXIT),
        Err(err) => {
            let code = exit_code(&err);
            if json {
                if let Err(render) = cli::render_error_json(&err, code) {
                    eprintln!("speechctl: {render:#}");
                }
            } else {
                eprintln!("speechctl: {err:#}");
            }
            ExitCode::from(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn exit_code_follows_error_class() {
        let err = anyhow::Error::new(InstallError::Cancelled);
        assert_eq!(exit_code(&err), 130);

        let err = Err::<(), _>(InstallError::OfflineRequired {
            source_url: "https://a/m.json".into(),
        })
        .context("stt install failed")
        .unwrap_err();
        assert_eq!(exit_code(&err), 3);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 5);
    }
}
