use clap::ArgMatches;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::modbus::client::{ModbusClient, ModbusClientTrait};
use crate::modbus::frame::RegisterBank;
use crate::output::{ConsoleFormatter, JsonFormatter, UpdateFormatter};
use crate::services::{ModbusServer, PollService};

/// Dispatch the matched subcommand. Returns Ok(false) when nothing matched
/// so the caller can print usage.
pub async fn handle_subcommands(
    matches: &ArgMatches,
    config: &Config,
) -> Result<bool, Box<dyn std::error::Error>> {
    let formatter = select_formatter(matches);

    if matches.subcommand_matches("server").is_some() {
        let server = ModbusServer::new(config.server.clone());
        server.run().await?;
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("read") {
        let bank = parse_bank(sub.get_one::<String>("bank").unwrap())?;
        let start: u16 = sub.get_one::<String>("start").unwrap().parse()?;
        let count: u16 = sub.get_one::<String>("count").unwrap().parse()?;

        let client = connect(config).await?;
        let values = client.read_bank(bank, start, count).await?;
        println!("📊 {} {}..+{}: {}", bank, start, count, formatter.format_values(&values));
        client.disconnect().await;
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("write") {
        let write_type = sub.get_one::<String>("type").unwrap().to_lowercase();
        let address: u16 = sub.get_one::<String>("address").unwrap().parse()?;
        let value_raw = sub.get_one::<String>("value").unwrap();

        // Validate the target before touching the network.
        enum Write {
            Coil(bool),
            Register(u32),
        }
        let write = match write_type.as_str() {
            "coil" => {
                let value: u8 = value_raw.parse()?;
                if value > 1 {
                    return Err("coil value must be 0 or 1".into());
                }
                Write::Coil(value == 1)
            }
            "register" => Write::Register(value_raw.parse()?),
            other => return Err(format!("unknown write type: {}", other).into()),
        };

        let client = connect(config).await?;
        match write {
            Write::Coil(on) => client.write_single_coil(address, on).await?,
            Write::Register(value) => client.write_single_register(address, value).await?,
        }
        println!("✅ Write successful: {} {} = {}", write_type, address, value_raw);
        client.disconnect().await;
        return Ok(true);
    }

    if let Some(sub) = matches.subcommand_matches("watch") {
        let banks: Vec<RegisterBank> = sub
            .get_one::<String>("banks")
            .unwrap()
            .split(',')
            .map(|name| parse_bank(name.trim()))
            .collect::<Result<_, _>>()?;
        let start: u16 = sub.get_one::<String>("start").unwrap().parse()?;
        let count: u16 = sub.get_one::<String>("count").unwrap().parse()?;
        let interval_ms: u64 = match sub.get_one::<String>("interval") {
            Some(value) => value.parse()?,
            None => config.client.poll_interval_ms,
        };

        let client = connect(config).await?;
        let (service, mut updates) = PollService::new(Arc::clone(&client), 64);
        let mut handles = Vec::with_capacity(banks.len());
        for bank in banks {
            handles.push(service.start_watch(
                bank,
                start,
                count,
                Duration::from_millis(interval_ms),
            )?);
        }

        print!("{}", formatter.format_header());
        info!("🛑 Press Ctrl+C to stop");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Stopping watches...");
                    break;
                }
                update = updates.recv() => {
                    match update {
                        Some(update) => println!("{}", formatter.format_update(&update)),
                        None => break,
                    }
                }
            }
        }

        service.stop_all();
        client.disconnect().await;
        return Ok(true);
    }

    Ok(false)
}

fn select_formatter(matches: &ArgMatches) -> Box<dyn UpdateFormatter> {
    match matches.get_one::<String>("format").map(|s| s.as_str()) {
        Some("json") => {
            info!("🎨 Using JSON formatter");
            Box::new(JsonFormatter)
        }
        _ => Box::new(ConsoleFormatter),
    }
}

fn parse_bank(name: &str) -> Result<RegisterBank, Box<dyn std::error::Error>> {
    RegisterBank::parse(name)
        .ok_or_else(|| format!("unknown register bank: {}", name).into())
}

async fn connect(config: &Config) -> Result<Arc<ModbusClient>, Box<dyn std::error::Error>> {
    let client = ModbusClient::connect(
        &config.client.target_host,
        config.client.target_port,
        config.client.unit_id,
        config.request_timeout(),
    )
    .await?;
    Ok(Arc::new(client))
}
