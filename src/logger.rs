//! Logging initialization.
//!
//! `LoggerManager` validates the `[logger]` section and installs the global
//! `tracing` subscriber with one layer per enabled sink: console, systemd
//! journald and a daily rolling file. Each sink gets its own `EnvFilter`;
//! `RUST_LOG` overrides the configured level.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, FileConfig, LogFormat, LoggerConfig},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// Journald socket unavailable.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to create log file appender: {0}")]
    FileAppender(#[from] InitError),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error(
        "Failed to initialize journald logger, and console logger is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,
}

pub struct LoggerManager {
    config: LoggerConfig,
    /// Flushes the file sink on drop; keep the manager alive until exit.
    file_guard: Option<WorkerGuard>,
}

impl LoggerManager {
    /// # Errors
    ///
    /// `LoggerError::ValidationError` when the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager {
            config,
            file_guard: None,
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.effective_level()))
    }

    /// Builds the enabled layers and installs the global subscriber.
    ///
    /// Call once, before anything else logs.
    ///
    /// # Errors
    ///
    /// Fails when no sink could be set up, when the log directory is not
    /// usable, or when journald fails while the console is also enabled.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry().with(layers).init();
        Ok(())
    }

    fn build_layers(&mut self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.init_console_logger(console_config, self.filter()));
        }

        if let Some(file_config) = self.config.file.clone().filter(|f| f.enabled) {
            let (layer, guard) = self.init_file_logger(&file_config, self.filter())?;
            layers.push(layer);
            self.file_guard = Some(guard);
            print_info!(
                "File logger initialized in {} (keeping {} files)",
                file_config.directory,
                file_config.max_log_files
            );
        }

        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.init_journald_logger(self.filter()) {
                Ok(journald_layer) => {
                    layers.push(journald_layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald_config.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console_enabled() {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }

    fn init_console_logger(&self, config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => layer.json().with_filter(filter).boxed(),
            LogFormat::Pretty => layer.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => layer.compact().with_filter(filter).boxed(),
        }
    }

    /// Daily rolling file written from a background thread.
    fn init_file_logger(
        &self,
        config: &FileConfig,
        filter: EnvFilter,
    ) -> Result<(BoxedLayer, WorkerGuard), LoggerError> {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&config.file_name_prefix)
            .max_log_files(config.max_log_files)
            .build(&config.directory)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed();
        Ok((layer, guard))
    }

    fn init_journald_logger(&self, filter: EnvFilter) -> Result<BoxedLayer, LoggerError> {
        let journald_layer = tracing_journald::layer()?;
        Ok(journald_layer.with_filter(filter).boxed())
    }
}
