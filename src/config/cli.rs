use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

pub const USAGE: &str = "\
usage: libvirt-snmp-subagent [-D<tokens>] [-f] [-L] [-M] [-H] [-x ADDRESS] [-c FILE] [LISTENING ADDRESSES]
\t-f\tDo not fork() from the calling shell.
\t-DTOKEN[,TOKEN,...]
\t\tTurn on debugging output for the given TOKEN(s).
\t\tWithout any tokens specified, it defaults to printing
\t\tall the tokens (which is equivalent to the keyword 'ALL').
\t-H\tDisplay a list of configuration file directives
\t\tunderstood by the agent and then exit.
\t-M\tRun as a normal SNMP Agent instead of an AgentX sub-agent.
\t-x ADDRESS\tconnect to master agent at ADDRESS (default /var/agentx/master).
\t-L\tDo not open a log file; print all messages to stderr.
\t-c FILE\tRead configuration from FILE.
";

#[derive(Debug, Clone, Parser)]
#[command(name = "libvirt-snmp-subagent")]
#[command(about = "SNMP subagent exposing libvirt guests as libvirtGuestTable")]
pub struct CliOptions {
    /// Turn on debugging output for the given tokens (bare -D means ALL)
    #[arg(
        short = 'D',
        value_name = "TOKEN,...",
        num_args = 0..=1,
        default_missing_value = "ALL",
        value_delimiter = ',',
        action = ArgAction::Append
    )]
    pub debug_tokens: Vec<String>,

    /// Do not fork from the calling shell
    #[arg(short = 'f')]
    pub foreground: bool,

    /// Print the configuration directives understood and exit
    #[arg(short = 'H')]
    pub print_directives: bool,

    /// Run as a normal SNMP agent instead of an AgentX subagent
    #[arg(short = 'M')]
    pub master: bool,

    /// Log to stderr instead of the configured log file
    #[arg(short = 'L')]
    pub log_stderr: bool,

    /// AgentX master address (default /var/agentx/master)
    #[arg(short = 'x', value_name = "ADDRESS")]
    pub agentx_socket: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listening addresses for master mode
    #[arg(value_name = "LISTENING ADDRESSES")]
    pub listen_addresses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandLine {
    pub options: CliOptions,
    /// Positional addresses joined with commas, if any were given.
    pub listen_spec: Option<String>,
}

#[derive(Debug)]
pub enum Invocation {
    Run(CommandLine),
    /// `-h`/`--help`: print and exit 0.
    Help(String),
    /// Unrecognized flag or missing argument: print `unknown option` and the
    /// usage text, then exit 0.
    UnknownOption(String),
    Fatal { code: i32, message: String },
}

pub fn parse_command_line<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match CliOptions::command().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) => {
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    Invocation::Help(e.render().to_string())
                }
                _ => Invocation::UnknownOption(offending_option(&e)),
            };
        }
    };
    let options = match CliOptions::from_arg_matches(&matches) {
        Ok(options) => options,
        Err(e) => return Invocation::UnknownOption(offending_option(&e)),
    };

    let indices: Vec<usize> = matches
        .indices_of("listen_addresses")
        .map(|indices| indices.collect())
        .unwrap_or_default();
    match join_listen_addresses(&options.listen_addresses, &indices) {
        Ok(listen_spec) => Invocation::Run(CommandLine {
            options,
            listen_spec,
        }),
        Err(index) => Invocation::Fatal {
            code: 1,
            message: format!("malloc failure processing argv[{}]", index),
        },
    }
}

fn offending_option(e: &clap::Error) -> String {
    match e.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => arg
            .split_whitespace()
            .next()
            .unwrap_or(arg)
            .trim_start_matches('-')
            .to_string(),
        _ => "?".to_string(),
    }
}

/// Joins positional addresses with commas. On allocation failure returns the
/// argv index of the address being appended.
pub fn join_listen_addresses(
    addresses: &[String],
    argv_indices: &[usize],
) -> std::result::Result<Option<String>, usize> {
    let mut spec: Option<String> = None;
    for (position, address) in addresses.iter().enumerate() {
        let index = argv_indices.get(position).copied().unwrap_or(position + 1);
        match spec.as_mut() {
            Some(joined) => {
                joined
                    .try_reserve(address.len() + 1)
                    .map_err(|_| index)?;
                joined.push(',');
                joined.push_str(address);
            }
            None => {
                let mut first = String::new();
                first.try_reserve(address.len()).map_err(|_| index)?;
                first.push_str(address);
                spec = Some(first);
            }
        }
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> CommandLine {
        match parse_command_line(std::iter::once("libvirt-snmp-subagent").chain(args.iter().copied())) {
            Invocation::Run(command_line) => command_line,
            other => panic!("expected Run, got {:?}", other),
        }
    }

    #[test]
    fn test_flags() {
        let cl = run(&["-f", "-L", "-M", "-x", "tcp:localhost:705"]);
        assert!(cl.options.foreground);
        assert!(cl.options.log_stderr);
        assert!(cl.options.master);
        assert!(!cl.options.print_directives);
        assert_eq!(cl.options.agentx_socket.as_deref(), Some("tcp:localhost:705"));
        assert_eq!(cl.listen_spec, None);
    }

    #[test]
    fn test_debug_tokens() {
        let cl = run(&["-Dagentx,snmp", "-Dvirsh", "-f"]);
        assert_eq!(cl.options.debug_tokens, vec!["agentx", "snmp", "virsh"]);

        let cl = run(&["-D", "-f"]);
        assert_eq!(cl.options.debug_tokens, vec!["ALL"]);
    }

    #[test]
    fn test_positional_addresses_are_comma_joined() {
        let cl = run(&["-f", "udp:161", "localhost:1161"]);
        assert_eq!(cl.listen_spec.as_deref(), Some("udp:161,localhost:1161"));
    }

    #[test]
    fn test_unknown_option() {
        match parse_command_line(["libvirt-snmp-subagent", "-q"]) {
            Invocation::UnknownOption(option) => assert_eq!(option, "q"),
            other => panic!("expected UnknownOption, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_argument_is_treated_as_unknown_option() {
        assert!(matches!(
            parse_command_line(["libvirt-snmp-subagent", "-x"]),
            Invocation::UnknownOption(_)
        ));
    }

    #[test]
    fn test_help() {
        assert!(matches!(
            parse_command_line(["libvirt-snmp-subagent", "--help"]),
            Invocation::Help(_)
        ));
    }

    #[test]
    fn test_join_listen_addresses() {
        let addresses = vec!["udp:161".to_string(), "tcp:1161".to_string()];
        assert_eq!(
            join_listen_addresses(&addresses, &[2, 3]).unwrap().as_deref(),
            Some("udp:161,tcp:1161")
        );
        assert_eq!(join_listen_addresses(&[], &[]).unwrap(), None);
    }
}
