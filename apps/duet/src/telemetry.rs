pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(build_env_filter(config.level.to_filter()))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        match std::env::var("DUET_LOG_FILTER") {
            Ok(filter) => EnvFilter::new(filter),
            Err(_) => EnvFilter::new(default_filter_for(level, allow_dependency_traces())),
        }
    }

    /// Chatty transport internals that drown out our own traces.
    const TRACE_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_mdns",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    fn default_filter_for(level: LevelFilter, dependency_traces: bool) -> String {
        let base = match level {
            LevelFilter::TRACE => "info,duet_client_core=trace,duet=trace",
            LevelFilter::DEBUG => "info,duet_client_core=debug,duet=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        let mut filter = base.to_owned();
        if level == LevelFilter::TRACE && !dependency_traces {
            for target in TRACE_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        filter
    }

    fn allow_dependency_traces() -> bool {
        std::env::var("DUET_TRACE_DEPS")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test_timeout::timeout]
        fn trace_filter_throttles_dependencies() {
            let filter = default_filter_for(LevelFilter::TRACE, false);
            assert!(filter.starts_with("info,duet_client_core=trace"));
            assert!(filter.contains("webrtc_ice=info"));
            assert_eq!(
                default_filter_for(LevelFilter::TRACE, true),
                "info,duet_client_core=trace,duet=trace"
            );
            assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
        }
    }
}
