//! Logging setup shared by the binaries of this workspace.
use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    /// Style of the spinners shown for spans carrying `indicatif.pb_show`.
    pub static ref PB_SCAN_STYLE: ProgressStyle =
        ProgressStyle::with_template("{span_child_prefix}{spinner} {wide_msg} ({elapsed})")
            .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// Returned by [TracingBuilder::build], gives access to the terminal without
/// clobbering progress output.
#[derive(Clone)]
pub struct TracingHandle {
    stdout: IndicatifWriter<writer::Stdout>,
}

impl TracingHandle {
    /// A writer for stdout. Prefer `writeln!(handle.stdout(), ...)` over
    /// `println!`.
    pub fn stdout(&self) -> IndicatifWriter<writer::Stdout> {
        self.stdout.clone()
    }
}

/// Configures the global subscriber: an env filter defaulting to
/// [TracingBuilder::level], compact logs on stderr and optional progress
/// spinners.
pub struct TracingBuilder {
    level: Level,
    progress: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            progress: false,
        }
    }
}

impl TracingBuilder {
    /// Default level, used unless RUST_LOG says otherwise.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn enable_progressbar(mut self) -> Self {
        self.progress = true;
        self
    }

    pub fn build(self) -> Result<TracingHandle, Error> {
        let indicatif = IndicatifLayer::new().with_progress_style(PB_SCAN_STYLE.clone());
        let stdout = indicatif.get_stdout_writer();

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;
        let logs = tracing_subscriber::fmt::Layer::new()
            .with_writer(indicatif.get_stderr_writer())
            .compact();
        let progress = self
            .progress
            .then(|| indicatif.with_filter(IndicatifFilter::new(false)));

        tracing_subscriber::registry()
            .with(filter)
            .with(logs)
            .with(progress)
            .try_init()?;

        Ok(TracingHandle { stdout })
    }
}
