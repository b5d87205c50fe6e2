#[macro_use]
extern crate prettytable;
use prettytable::Table;

use clap::Parser;

use cmi::control::{Request, ResponseKind};
use cmi::ConduitId;
use cmictl::{reply_timeout, request};

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI I/O conduit statistics")]
struct Opts {
    /// SepIo conduit index; all conduits when omitted
    #[arg(short, long)]
    conduit: Option<u16>,
    /// Reset the counters of the given conduit
    #[arg(long, requires = "conduit")]
    clear: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let conduit = opts.conduit.map(ConduitId::SepIo);

    if opts.clear {
        if let Some(conduit) = conduit {
            request(&Request::ClearStats(conduit), reply_timeout(0))?;
            println!("cleared {}", conduit);
        }
        return Ok(());
    }

    let stats = match request(&Request::Stats(conduit), reply_timeout(0))? {
        ResponseKind::Stats(stats) => stats,
        other => anyhow::bail!("invalid response: {:?}", other),
    };

    let mut table = Table::new();
    table.add_row(row![bFc =>
        "Conduit", "Sent ops", "Sent bytes", "Sent errors",
        "Received ops", "Received bytes", "Received errors"
    ]);
    for (conduit, s) in stats {
        table.add_row(row![
            conduit,
            s.sent_ops,
            s.sent_bytes,
            Fr->s.sent_errors,
            s.received_ops,
            s.received_bytes,
            Fr->s.received_errors
        ]);
    }
    table.printstd();
    Ok(())
}
