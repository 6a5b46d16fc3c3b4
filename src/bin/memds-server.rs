use clap::Parser;
use memds::{Config, MasterAddr, Server};
use std::process::exit;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long)]
    #[clap(default_value_t = 6379)]
    #[clap(help = "Port to bind this server to")]
    port: u16,

    #[clap(long)]
    #[clap(min_values = 1, max_values = 2)]
    #[clap(value_name = "HOST PORT")]
    #[clap(help = "Run as a replica of the given master")]
    replicaof: Option<Vec<String>>,

    #[clap(long)]
    #[clap(default_value = "./")]
    #[clap(help = "Directory the startup snapshot is read from")]
    dir: String,

    #[clap(long)]
    #[clap(default_value = "dump.rdb")]
    #[clap(help = "File name of the startup snapshot")]
    dbfilename: String,
}

fn main() {
    // set log collector
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::DEBUG)
        .init();

    info!("Logger Initialized");

    let args = Args::parse();

    let replicaof = match args.replicaof {
        Some(values) => match MasterAddr::from_flag_values(&values) {
            Ok(addr) => Some(addr),
            Err(message) => {
                eprintln!("{}", message);
                exit(1);
            }
        },
        None => None,
    };

    let config = Config {
        port: args.port,
        replicaof,
        dir: args.dir,
        dbfilename: args.dbfilename,
    };

    info!("Application Started: Version {}", env!("CARGO_PKG_VERSION"));

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to bind: {}", err);
            exit(1);
        }
    };

    if let Err(err) = server.run() {
        error!("server terminated: {}", err);
        exit(1);
    }
}
