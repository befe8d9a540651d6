use std::process::ExitCode;

use fleetbench::error::BenchError;

fn main() -> ExitCode {
    match fleetbench::cli::run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            match BenchError::find(&err) {
                Some(fault) => eprintln!("fleetbench: {fault}\n  caused by: {err:#}"),
                None => eprintln!("fleetbench: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
