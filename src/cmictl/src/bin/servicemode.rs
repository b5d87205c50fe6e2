use clap::{Parser, ValueEnum};

use cmi::control::{Request, ResponseKind};
use cmictl::{reply_timeout, request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Enter,
    Leave,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI service mode control")]
struct Opts {
    #[arg(value_enum)]
    action: Action,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let req = match opts.action {
        Action::Enter => Request::EnterServiceMode,
        Action::Leave => Request::LeaveServiceMode,
    };
    match request(&req, reply_timeout(0))? {
        ResponseKind::Ok => println!("service mode: {:?}", opts.action),
        other => anyhow::bail!("invalid response: {:?}", other),
    }
    Ok(())
}
