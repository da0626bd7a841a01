use anyhow::{Context, Result};
use libvirt_snmp::config::cli::{CommandLine, USAGE};
use libvirt_snmp::config::{self, Overrides};
use libvirt_snmp::core::shutdown;
use libvirt_snmp::utils::logger::{self, LogTarget};
use libvirt_snmp::utils::{daemon, validation::Validate};
use libvirt_snmp::{parse_command_line, Agent, AgentConfig, AgentEngine, GuestTable, Invocation};
use std::process::exit;
use std::sync::Arc;

const AGENT_NAME: &str = "libvirtGuestTable";

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn load_config(command_line: &CommandLine) -> Result<AgentConfig> {
    let config = AgentConfig::load(command_line.options.config.as_deref())
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_agent(command_line: &CommandLine, config: &AgentConfig) -> Result<Agent> {
    let overrides = Overrides {
        master: command_line.options.master,
        agentx_socket: command_line.options.agentx_socket.as_deref(),
        listen_spec: command_line.listen_spec.as_deref(),
    };
    let settings = config::agent_settings(config, &overrides)?;
    let source = config::guest_source(config)?;

    let mut agent = Agent::new(AGENT_NAME, settings);
    agent.register(Arc::new(GuestTable::new(source, config.cache_timeout())));
    Ok(agent)
}

/// `-H`: list every directive the agent and its modules understand.
fn print_directives(agent: Agent) -> Result<()> {
    let mut directives = AgentConfig::directives();
    directives.extend(agent.registry().directives());
    config::print_directive_usage(&mut std::io::stderr(), "  ", &directives)?;
    runtime()?.block_on(agent.shutdown());
    Ok(())
}

async fn serve(mut agent: Agent) -> Result<()> {
    agent.start().await.context("failed to start agent")?;

    let (trigger, mut shutdown) = shutdown::channel();
    let signals = shutdown::install_signal_handlers(trigger)?;

    let mut engine = AgentEngine::new(agent);
    let result = engine.run(&mut shutdown).await;
    signals.abort();

    engine.into_processor().shutdown().await;
    let iterations = result.context("request loop failed")?;
    tracing::info!("processed {} iterations, exiting", iterations);
    Ok(())
}

fn main() {
    let command_line = match parse_command_line(std::env::args_os()) {
        Invocation::Run(command_line) => command_line,
        Invocation::Help(text) => {
            print!("{}", text);
            exit(0);
        }
        Invocation::UnknownOption(option) => {
            eprintln!("unknown option {}", option);
            print!("{}", USAGE);
            exit(0);
        }
        Invocation::Fatal { code, message } => {
            eprintln!("{}", message);
            exit(code);
        }
    };

    let config = match load_config(&command_line) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            exit(1);
        }
    };

    let target = if command_line.options.log_stderr {
        LogTarget::Stderr
    } else {
        match &config.logging.file {
            Some(path) => LogTarget::File(path.clone()),
            None => LogTarget::Discard,
        }
    };
    if let Err(e) = logger::init_logger(target, config.logging.format, &command_line.options.debug_tokens) {
        eprintln!("❌ {}", e);
        exit(1);
    }
    tracing::debug!(target: "main", "command line: {:?}", command_line);

    let agent = match build_agent(&command_line, &config) {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            exit(1);
        }
    };

    if command_line.options.print_directives {
        let code = match print_directives(agent) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("❌ {:#}", e);
                1
            }
        };
        exit(code);
    }

    if !command_line.options.foreground {
        if let Err(e) = daemon::daemonize(command_line.options.log_stderr) {
            tracing::error!("{}", e);
            exit(255);
        }
    }

    let result = runtime()
        .context("failed to build tokio runtime")
        .and_then(|rt| rt.block_on(serve(agent)));
    if let Err(e) = result {
        tracing::error!("{:#}", e);
        if command_line.options.foreground {
            eprintln!("❌ {:#}", e);
        }
        exit(1);
    }
}
