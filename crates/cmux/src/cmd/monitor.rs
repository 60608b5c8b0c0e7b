use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmux::{NotificationFilter, SessionEvent};
use tracing::warn;

use crate::cmd::MonitorArgs;
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_call_notification, print_notification, OutputFormat};

const TICK: Duration = Duration::from_millis(200);

pub fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.device.session_config()?;
    let mut session = args.device.connect(config)?;
    let channel = session
        .open_channel(&args.channel)
        .map_err(|err| session_error("open channel failed", err))?;
    for prefix in &args.notify {
        session
            .register_notification(channel, NotificationFilter::new(prefix.as_str()))
            .map_err(|err| session_error("register failed", err))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        session
            .run_once(Some(TICK))
            .map_err(|err| session_error("monitor failed", err))?;

        while let Some(event) = session.poll_event() {
            match event {
                SessionEvent::Notification {
                    channel,
                    notification,
                } => print_notification(channel, &notification, format),
                SessionEvent::CallNotification { channel, line } => {
                    print_call_notification(channel, &line, format)
                }
                SessionEvent::DeviceDead { channel } => {
                    warn!(channel, "modem stopped answering");
                    continue;
                }
                SessionEvent::ChannelClosed { channel: closed, cause } if closed == channel => {
                    return Err(CliError::new(
                        TRANSPORT_ERROR,
                        format!("channel {closed} closed: {cause:?}"),
                    ));
                }
                _ => continue,
            }
            printed = printed.saturating_add(1);
            if args.count.is_some_and(|count| printed >= count) {
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    }

    session
        .shutdown()
        .map_err(|err| session_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
