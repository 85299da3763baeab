use std::io::Write;
use std::sync::Once;

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Handles the crate's log messages, prefixing each record with the emulated
/// core the calling host thread is driving.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static INIT: Once = Once::new();

/// Installs the logger. Safe to call more than once; later calls are no-ops.
pub fn init() {
	INIT.call_once(|| {
		log::set_logger(&LOGGER).unwrap();
		log::set_max_level(
			std::env::var("NX_KERNEL_LOG")
				.ok()
				.and_then(|level| level.parse().ok())
				.unwrap_or(LevelFilter::Warn),
		);
	});
}

fn level_style(level: Level) -> anstyle::Style {
	let color = match level {
		Level::Error => AnsiColor::Red,
		Level::Warn => AnsiColor::Yellow,
		Level::Info => AnsiColor::Green,
		Level::Debug => AnsiColor::Cyan,
		Level::Trace => AnsiColor::BrightBlack,
	};
	anstyle::Style::new().fg_color(Some(color.into()))
}

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let style = level_style(record.level());
		let core = match crate::kernel::logging_core_id() {
			Some(core) => format!("{core}"),
			None => "-".to_string(),
		};
		let mut stderr = std::io::stderr().lock();
		let _ = writeln!(
			stderr,
			"[{core}][{style}{:5}{style:#}] {}",
			record.level(),
			record.args()
		);
	}

	fn flush(&self) {
		let _ = std::io::stderr().lock().flush();
	}
}
