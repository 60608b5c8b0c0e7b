use cmux::{Command, CommandResult, RetryId, RetryPolicy, Session, SessionEvent};

use crate::cmd::{parse_duration, ChatArgs};
use crate::exit::{result_code, session_error, CliResult, SUCCESS};
use crate::output::{print_result, OutputFormat};

pub fn run(args: ChatArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let policy = match args.retry {
        Some(attempts) => Some(RetryPolicy {
            attempts: attempts.max(1),
            interval: parse_duration(&args.retry_interval)?,
            ..RetryPolicy::default()
        }),
        None => None,
    };

    let config = args.device.session_config()?;
    let mut session = args.device.connect(config)?;
    let channel = session
        .open_channel(&args.channel)
        .map_err(|err| session_error("open channel failed", err))?;

    let mut code = SUCCESS;
    for line in &args.commands {
        let command = Command::new(line.as_str()).with_timeout(timeout);
        let result = match &policy {
            Some(policy) => {
                let id = session
                    .submit_with_retry(channel, command, policy.clone())
                    .map_err(|err| session_error("submit failed", err))?;
                wait_for_retry(&mut session, id)?
            }
            None => session
                .execute(channel, command)
                .map_err(|err| session_error("command failed", err))?,
        };
        print_result(channel, &result, format);
        code = result_code(result.code);
        if code != SUCCESS {
            break;
        }
    }

    session
        .shutdown()
        .map_err(|err| session_error("shutdown failed", err))?;
    Ok(code)
}

fn wait_for_retry(session: &mut Session, id: RetryId) -> CliResult<CommandResult> {
    loop {
        while let Some(event) = session.poll_event() {
            if let SessionEvent::RetryFinished { id: done, result, .. } = event {
                if done == id {
                    return Ok(result);
                }
            }
        }
        session
            .run_once(None)
            .map_err(|err| session_error("command failed", err))?;
    }
}
