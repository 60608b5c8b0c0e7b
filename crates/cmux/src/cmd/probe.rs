use cmux::mux::cmux_command;
use cmux::Session;
use cmux::MultiplexerRegistry;
use tracing::info;

use crate::cmd::ProbeArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_probe, OutputFormat, ProbeOutput};

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.device.session_config()?;
    let stream = args.device.open_stream()?;
    let transport = stream.transport_name();

    let session = Session::establish(stream, &MultiplexerRegistry::with_defaults(), config)
        .map_err(|err| session_error("probe failed", err))?;
    let variant = session.variant();
    let out = ProbeOutput {
        device: args.device.device.clone(),
        transport,
        variant,
        cmux_command: (variant == "gsm0710").then(|| cmux_command(&session.config().mux)),
        frames_decoded: session.link_health().map(|health| health.frames_decoded),
    };
    info!(variant, "probe complete");

    session
        .shutdown()
        .map_err(|err| session_error("shutdown failed", err))?;
    print_probe(&out, format);
    Ok(SUCCESS)
}
