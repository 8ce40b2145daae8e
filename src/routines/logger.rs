use std::time::{Duration, Instant};

use crate::routines::output::OutputFile;
use crate::routines::settings::Settings;
use anyhow::Result;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the subscriber that reports the progress of a fit
///
/// Sampling, restarts, failed chains and the final status are logged through `tracing` at `log.level`.
/// Lines are stamped with the time elapsed since the fit started and go to stdout. When the fit writes its
/// outputs, they are also written to `log.file` next to `draws.csv` and `summary.csv`.
///
/// With `log.write = false` nothing is installed, so a library caller keeps its own subscriber. Later fits in
/// the same process reuse the subscriber installed by the first one.
pub fn setup_log(settings: &Settings) -> Result<()> {
    if !settings.log.write {
        return Ok(());
    }

    let env_filter = EnvFilter::new(settings.log.level.as_str());
    let clock = FitClock {
        start: Instant::now(),
    };
    let subscriber = Registry::default().with(env_filter);

    let file_layer = if settings.output.write {
        let logfile = OutputFile::new(&settings.output.path, &settings.log.file)?;
        Some(
            fmt::layer()
                .with_writer(logfile.into_file())
                .with_ansi(false)
                .with_timer(clock.clone()),
        )
    } else {
        None
    };

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_timer(clock);

    if subscriber
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Keeping the subscriber of an earlier fit");
    }

    Ok(())
}

/// Stamps log lines with the time elapsed since the fit started
#[derive(Clone)]
struct FitClock {
    start: Instant,
}

/// `m:ss.mmm`, minutes unbounded
fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    format!(
        "{}:{:02}.{:03}",
        millis / 60_000,
        (millis / 1000) % 60,
        millis % 1000
    )
}

impl FormatTime for FitClock {
    fn format_time(&self, w: &mut Writer<'_>) -> Result<(), std::fmt::Error> {
        write!(w, "{:>9}", format_elapsed(self.start.elapsed()))
    }
}
