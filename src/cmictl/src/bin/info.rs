#[macro_use]
extern crate prettytable;
use prettytable::Table;

use clap::Parser;

use cmi::control::{Request, ResponseKind};
use cmictl::{reply_timeout, request};

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI node status viewer")]
struct Opts {
    /// Print only the aggregate service state
    #[arg(short, long)]
    state: bool,
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    if opts.state {
        match request(&Request::State, reply_timeout(0))? {
            ResponseKind::State(state) => println!("{:?}", state),
            other => anyhow::bail!("invalid response: {:?}", other),
        }
        return Ok(());
    }

    let info = match request(&Request::Info, reply_timeout(0))? {
        ResponseKind::Info(info) => info,
        other => anyhow::bail!("invalid response: {:?}", other),
    };

    let peer_role = info
        .peer_role
        .map_or_else(|| "unknown".to_string(), |r| format!("{:?}", r));
    let mut table = Table::new();
    table.add_row(row![bFc => "SP", "Role", "Peer role", "Peer alive", "Peer degraded", "State"]);
    table.add_row(row![
        info.sp,
        Fg->format!("{:?}", info.role),
        peer_role,
        yes_no(info.peer_alive),
        yes_no(info.peer_degraded),
        format!("{:?}", info.state)
    ]);
    table.printstd();

    let mut table = Table::new();
    table.add_row(row![bFm => "Traffic", "I/O ready", "Peer table", "Waiting", "Outstanding", "Panic"]);
    table.add_row(row![
        yes_no(info.traffic_enabled),
        yes_no(info.io_ready),
        yes_no(info.peer_table),
        info.waiting_ops,
        info.outstanding_ops,
        Fy->format!("{:?}", info.panic)
    ]);
    table.printstd();
    Ok(())
}
