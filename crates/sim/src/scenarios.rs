//! Simulation scenarios driving a link station over a null-modem pair

use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_link_core::{decode_and_correct, flip_bit, generate_fcs};
use serial_link_mac::{null_modem, LinkConfig, LinkStation};
use tokio::time::{sleep, Instant};

const SETTLE: Duration = Duration::from_millis(200);

async fn open_station(config: LinkConfig, seed: u64) -> LinkStation {
    let (com3, com4) = null_modem("COM3", "COM4");
    log::debug!("Opening station COM3 -> COM4 with {:?}", config);
    let mut station = LinkStation::with_seed(config, seed);
    station.set_send_endpoint(com3);
    station.set_receive_endpoint(com4).await;
    station
}

/// Sends one message to itself and shows what came back.
pub async fn loopback_test(config: LinkConfig, message: &str) -> Result<()> {
    println!("\n=== Loopback Test ===");
    log::info!("Loopback test with a {}-byte message", message.len());
    let mut station = open_station(config, 0x5eed).await;
    println!(
        "Send port: {}  Receive port: {}  Rate: {} baud",
        station.send_endpoint().unwrap_or("-"),
        station.receive_endpoint().unwrap_or("-"),
        station.baud_rate()
    );

    let start = Instant::now();
    match station.send_message(message.as_bytes()).await {
        Ok(report) => {
            println!(
                "{} {} frames, {} wire bytes in {:?}",
                "✓ Sent".green(),
                report.frames_sent,
                report.wire_bytes,
                start.elapsed()
            );
            println!("  Session: {}", report.session);
        }
        Err(e) => println!("{} {}", "✗ Send failed:".red(), e),
    }

    if let Some(description) = station.describe_last_frame() {
        println!("\nLast frame on the line:");
        for line in description.lines() {
            println!("  {}", line);
        }
    }

    sleep(SETTLE).await;
    let received = station.receive_message().await?;
    if received.is_empty() {
        println!("{}", "Nothing received".yellow());
    } else if received.corrupted {
        println!("{}", "Data corrupted (double or multiple error detected)".red());
        println!("Received: {}", received.text());
    } else {
        println!(
            "Received: {} ({} frames, {} corrected)",
            received.text().bright_white(),
            received.frames,
            received.corrected_frames
        );
    }

    station.shutdown().await;
    Ok(())
}

/// Pushes `count` messages through the link and reports delivery and
/// effective throughput.
pub async fn throughput_test(config: LinkConfig, count: usize, message_len: usize) -> Result<()> {
    println!("\n=== Throughput Test ===");
    println!("{} messages of {} bytes", count, message_len);
    log::info!("Throughput test: {} messages of {} bytes", count, message_len);
    let mut station = open_station(config, 0xfeed).await;
    let mut rng = StdRng::seed_from_u64(count as u64);

    let bar = ProgressBar::new(count as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")?.progress_chars("=> "),
    );

    let mut sent = 0usize;
    let mut failed = 0usize;
    let mut wire_bytes = 0usize;
    let start = Instant::now();
    for _ in 0..count {
        let message: Vec<u8> = (0..message_len).map(|_| rng.random_range(b' '..=b'~')).collect();
        match station.send_message(&message).await {
            Ok(report) => {
                sent += 1;
                wire_bytes += report.wire_bytes;
            }
            Err(e) => {
                failed += 1;
                log::warn!("Message {} of {} failed: {}", sent + failed, count, e);
                bar.println(format!("  {} {}", "✗".red(), e));
            }
        }
        bar.set_message(format!("{} failed", failed));
        bar.inc(1);
    }
    bar.finish_and_clear();
    let elapsed = start.elapsed();

    sleep(SETTLE).await;
    let received = station.receive_message().await?;
    let stats = station.stats().snapshot().await;

    println!("  - delivered messages: {}/{}", sent, count);
    println!("  - frames received: {} ({} corrected)", received.frames, received.corrected_frames);
    println!("  - corrupted data: {}", if received.corrupted { "yes".red() } else { "no".green() });
    println!("  - lifetime: {}", stats.lifetime);
    println!("  - time: {:?}", elapsed);
    println!(
        "  - effective throughput: {:.2} bps",
        (wire_bytes * 8) as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    station.shutdown().await;
    log::info!("Throughput test done: {}/{} delivered in {:?}", sent, count, elapsed);
    Ok(())
}

/// Flips one and then two bits of a payload and shows what the FCS makes of it.
pub fn hamming_demo(payload: &[u8]) {
    println!("\n=== Hamming Demo ===");
    let fcs = generate_fcs(payload);
    println!("Payload: {}", hex::encode_upper(payload));
    println!("FCS:     {}", hex::encode_upper(&fcs));

    let bits = payload.len() * 8;
    if bits < 2 {
        println!("Payload too short to corrupt");
        return;
    }

    let mut single = payload.to_vec();
    flip_bit(&mut single, bits / 2);
    let result = decode_and_correct(&single, &fcs);
    println!(
        "One flip at bit {}:  {} -> {} (corrected: {})",
        bits / 2,
        hex::encode_upper(&single),
        hex::encode_upper(&result.corrected_data),
        result.single_error_corrected
    );

    let mut double = single;
    flip_bit(&mut double, 0);
    let result = decode_and_correct(&double, &fcs);
    println!(
        "Two flips:          {} -> double error detected: {}",
        hex::encode_upper(&double),
        result.double_error_detected
    );
}
