use std::process::ExitCode;

use strix::vm::{Settings, StrixVm};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let mut args = std::env::args().skip(1);
	let Some(path) = args.next() else {
		eprintln!("usage: strix <program> [args...]");
		return ExitCode::from(2);
	};
	let program_args: Vec<String> = args.collect();

	let vm = StrixVm::new(Settings::default());
	match vm.start(path, program_args) {
		Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
		Err(error) => {
			eprintln!("error: {error}");
			ExitCode::FAILURE
		}
	}
}
