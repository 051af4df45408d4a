//! CSMA/CD serial link simulation

use anyhow::Result;
use colored::Colorize;
use serial_link_mac::STANDARD_BAUD_RATES;
use serial_link_sim::{scenarios, ChannelPresets};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    log::info!("Serial link simulation starting");

    println!("{}", "Serial Link Simulation".bright_blue().bold());
    println!("{}", "======================".bright_blue());
    println!("Supported rates: {:?}", STANDARD_BAUD_RATES);

    scenarios::hamming_demo(b"HELLO");

    let test_scenarios = vec![
        ("Clear Line", ChannelPresets::clear_line(), 10),
        ("Light Traffic", ChannelPresets::light_traffic(), 5),
        ("Lab Defaults", ChannelPresets::lab_defaults(), 2),
    ];

    for (name, config, count) in test_scenarios {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Busy: {}%", (config.busy_probability * 100.0) as u32);
        println!("Collision per byte: {}%", (config.collision_probability * 100.0) as u32);
        println!("Noise: {}", if config.noise_enabled { "on" } else { "off" });

        scenarios::loopback_test(config.clone(), "Hello over the serial line!").await?;
        scenarios::throughput_test(config, count, 40).await?;

        println!("{}", "Scenario done".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("{}", "\n>>> Testing: Heavy Traffic".bright_red().bold());
    scenarios::loopback_test(ChannelPresets::heavy_traffic(), "CSMA/CD under load").await?;

    println!("\n{}", "Simulation finished".bright_green().bold());
    Ok(())
}
