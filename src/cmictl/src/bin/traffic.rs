use clap::{Parser, ValueEnum};

use cmi::control::{Request, ResponseKind};
use cmictl::{reply_timeout, request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Enable,
    Disable,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI traffic control")]
struct Opts {
    #[arg(value_enum)]
    action: Action,
    /// How long a disable may wait for in-flight messages to drain
    #[arg(short, long, default_value_t = 10_000)]
    timeout_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let (req, wait) = match opts.action {
        Action::Enable => (Request::EnableTraffic, 0),
        Action::Disable => (
            Request::DisableTraffic {
                timeout_ms: opts.timeout_ms,
            },
            opts.timeout_ms,
        ),
    };
    match request(&req, reply_timeout(wait))? {
        ResponseKind::Ok => println!("traffic {:?}d", opts.action),
        other => anyhow::bail!("invalid response: {:?}", other),
    }
    Ok(())
}
