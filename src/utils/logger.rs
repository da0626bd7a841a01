use crate::config::LogFormat;
use crate::utils::error::{AgentError, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "libvirt_snmp=info";

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
    /// Everything is dropped.
    Discard,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` (or the crate default) plus one `<token>=trace` directive per
/// debug token. `ALL` turns on trace output everywhere.
pub fn build_filter(debug_tokens: &[String]) -> Result<EnvFilter> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    for token in debug_tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if token.eq_ignore_ascii_case("ALL") {
            filter = filter.add_directive(LevelFilter::TRACE.into());
            continue;
        }
        let directive: Directive = format!("{}=trace", token).parse().map_err(|e| {
            AgentError::InvalidConfigValueError {
                field: "-D".to_string(),
                value: token.to_string(),
                reason: format!("{}", e),
            }
        })?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn fmt_layer<W>(writer: W, format: LogFormat, ansi: bool, show_target: bool) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(show_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

pub fn init_logger(target: LogTarget, format: LogFormat, debug_tokens: &[String]) -> Result<()> {
    let filter = build_filter(debug_tokens)?;
    let show_target = !debug_tokens.is_empty();

    let layer = match target {
        LogTarget::Stderr => fmt_layer(std::io::stderr, LogFormat::Compact, true, show_target),
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    AgentError::config(format!("cannot open log file {}: {}", path.display(), e))
                })?;
            fmt_layer(Mutex::new(file), format, false, show_target)
        }
        LogTarget::Discard => fmt_layer(std::io::sink, format, false, show_target),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| AgentError::config(format!("logger already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_tokens_become_trace_directives() {
        let tokens = vec!["agentx".to_string(), "libvirtGuestTable".to_string()];
        let filter = build_filter(&tokens).unwrap().to_string();
        assert!(filter.contains("agentx=trace"));
        assert!(filter.contains("libvirtGuestTable=trace"));
    }

    #[test]
    fn test_all_token_enables_everything() {
        let filter = build_filter(&["ALL".to_string()]).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_empty_tokens_are_ignored() {
        assert!(build_filter(&[String::new(), " ".to_string()]).is_ok());
    }
}
