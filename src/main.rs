use anyhow::Result;
use clap::{Arg, Command};
use log::error;

use modbus_tcp_rust::cli::handle_subcommands;
use modbus_tcp_rust::config::Config;

fn build_cli() -> Command {
    Command::new("modbus_tcp_rust")
        .version(modbus_tcp_rust::VERSION)
        .about("Modbus TCP client/server core with a simulated PT-100 pressure sensor")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to TOML configuration file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .help("Target host (client) or bind host (server)"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Target port (client) or bind port (server)"),
        )
        .arg(
            Arg::new("unit")
                .long("unit")
                .value_name("ID")
                .help("Modbus unit identifier"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Per-request timeout in milliseconds"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .value_name("FORMAT")
                .help("Output format: console or json"),
        )
        .subcommand(Command::new("server").about("Run the simulated PT-100 Modbus TCP server"))
        .subcommand(
            Command::new("read")
                .about("Read one address range once")
                .arg(
                    Arg::new("bank")
                        .required(true)
                        .help("coils | discrete-inputs | holding-registers | input-registers"),
                )
                .arg(Arg::new("start").default_value("0").help("Start address"))
                .arg(Arg::new("count").default_value("1").help("Number of cells")),
        )
        .subcommand(
            Command::new("write")
                .about("Write a single coil or holding register")
                .arg(Arg::new("type").required(true).help("coil | register"))
                .arg(Arg::new("address").required(true).help("Cell address"))
                .arg(
                    Arg::new("value")
                        .required(true)
                        .help("0/1 for coils, 0-65535 for registers"),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Poll address ranges and print updates until Ctrl+C")
                .arg(
                    Arg::new("banks")
                        .required(true)
                        .help("Comma-separated bank list, e.g. coils,holding-registers"),
                )
                .arg(Arg::new("start").default_value("0").help("Start address"))
                .arg(Arg::new("count").default_value("1").help("Number of cells"))
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .value_name("MS")
                        .help("Poll interval in milliseconds"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_cli().get_matches();
    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(anyhow::anyhow!("invalid configuration: {}", e));
        }
    };

    match handle_subcommands(&matches, &config).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            build_cli().print_help()?;
            println!();
            Ok(())
        }
        Err(e) => {
            error!("❌ Command failed: {}", e);
            Err(anyhow::anyhow!("{}", e))
        }
    }
}
