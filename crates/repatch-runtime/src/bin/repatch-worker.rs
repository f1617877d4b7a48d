//! Worker process entry
//!
//! Spawned by the host, never run by hand. The entry argument selects the
//! job: `patcher <endpoint>` serves one patch session, `merge <action> …`
//! runs the split merger and reports on stdout.

use repatch_runtime::worker::{self, WorkerArgs};
use repatch_runtime::PATCHER_ENTRY;
use repatch_split::merge::{run_merge_entry, MERGE_ENTRY};
use std::path::Path;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match WorkerArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("repatch-worker: {err}");
            return ExitCode::from(2);
        }
    };

    match args.entry.as_str() {
        PATCHER_ENTRY => {
            let [endpoint] = args.args.as_slice() else {
                eprintln!("repatch-worker: {PATCHER_ENTRY} expects exactly one endpoint");
                return ExitCode::from(2);
            };
            match worker::run(Path::new(endpoint)).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("repatch-worker: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        MERGE_ENTRY => {
            let code = run_merge_entry(&args.args, &mut std::io::stdout().lock());
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        other => {
            eprintln!("repatch-worker: unknown entry {other}");
            ExitCode::from(2)
        }
    }
}
