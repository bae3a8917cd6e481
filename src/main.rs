use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Boots a 64-bit unikernel ELF image under KVM.
#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct Opts {
    /// Path to the guest ELF image
    kernel: PathBuf,
}

fn main() -> ExitCode {
    let opts = Opts::parse();

    match vmm::run(&opts.kernel) {
        Ok(status) => exit_code(status),
        Err(e) => {
            eprintln!("hermit-monitor: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from((status & 0xff) as u8)
}
