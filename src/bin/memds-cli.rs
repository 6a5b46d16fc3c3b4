use clap::Parser;
use memds::Client;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long)]
    #[clap(
        default_value_t = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6379))
    ]
    #[clap(help = "Server address to connect to")]
    addr: SocketAddr,

    #[clap(help = "Command to send")]
    command: String,

    #[clap(help = "Command arguments")]
    args: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let mut client = match Client::connect(args.addr) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("could not connect to {}: {}", args.addr, err);
            exit(1);
        }
    };

    let arg_refs: Vec<&str> = args.args.iter().map(String::as_str).collect();
    match client.send(&args.command, &arg_refs) {
        Ok(reply) => println!("{}", reply),
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    }
}
