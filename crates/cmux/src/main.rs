mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "cmux", version, about = "Cellular modem multiplexer and AT chat")]
struct Cli {
    /// Output format (default: table on a terminal, json otherwise).
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_with_several_commands() {
        let cli = Cli::try_parse_from([
            "cmux",
            "chat",
            "/dev/ttyUSB2",
            "AT+CGSN",
            "AT+CIMI",
            "--channel",
            "secondary",
            "--mode",
            "advanced",
        ])
        .expect("chat args should parse");

        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.commands, vec!["AT+CGSN", "AT+CIMI"]);
        assert_eq!(args.channel, "secondary");
        assert!(matches!(args.device.mode, cmd::Framing::Advanced));
    }

    #[test]
    fn chat_requires_a_command() {
        let err = Cli::try_parse_from(["cmux", "chat", "/dev/ttyUSB2"])
            .expect_err("missing command should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn retry_interval_needs_retry() {
        let err = Cli::try_parse_from([
            "cmux",
            "chat",
            "/dev/ttyUSB2",
            "AT",
            "--retry-interval",
            "2s",
        ])
        .expect_err("interval alone should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_monitor_prefix_list() {
        let cli = Cli::try_parse_from([
            "cmux",
            "monitor",
            "tcp:127.0.0.1:5000",
            "--notify",
            "+CREG:,+CEREG:",
            "--count",
            "2",
        ])
        .expect("monitor args should parse");
        let Command::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };
        assert_eq!(args.notify, vec!["+CREG:", "+CEREG:"]);
        assert_eq!(args.count, Some(2));
    }

    #[test]
    fn parses_global_format_after_subcommand() {
        let cli = Cli::try_parse_from(["cmux", "decode", "F9033F011CF9", "--format", "json"])
            .expect("decode args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Decode(_)));
    }
}
