use clap::{Parser, Subcommand};

use cmi::control::{Request, ResponseKind};
use cmictl::{reply_timeout, request};

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Ask the peer for permission to panic this node
    Request {
        #[arg(short, long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Give a granted permission back
    Release,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI panic permission")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.command {
        Command::Request { timeout_ms } => {
            match request(&Request::RequestPanic { timeout_ms }, reply_timeout(timeout_ms))? {
                ResponseKind::PanicGranted(true) => println!("granted"),
                ResponseKind::PanicGranted(false) => {
                    println!("denied");
                    std::process::exit(1);
                }
                other => anyhow::bail!("invalid response: {:?}", other),
            }
        }
        Command::Release => match request(&Request::ReleasePanic, reply_timeout(0))? {
            ResponseKind::Ok => println!("released"),
            other => anyhow::bail!("invalid response: {:?}", other),
        },
    }
    Ok(())
}
