use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("cmux {}", env!("CARGO_PKG_VERSION"));
    if args.extended {
        println!(
            "target: {}",
            option_env!("CMUX_BUILD_TARGET").unwrap_or(std::env::consts::ARCH)
        );
        println!("os: {}", std::env::consts::OS);
        println!("framing: basic, advanced");
        println!(
            "multiplexers: {}",
            cmux::MultiplexerRegistry::with_defaults().names().join(", ")
        );
    }
    Ok(SUCCESS)
}
