use clap::Parser;
use colored::*;
use console_core::digest::{sha256, to_hex};
use console_core::wire::{DIGEST_HEADER, SIZE_HEADER};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "console-ota")]
#[command(about = "Driver console firmware uploader", long_about = None)]
struct Cli {
    /// Console IP address (shown by the companion app after provisioning)
    ip: String,

    /// Firmware image to upload (defaults to release build)
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Port number (default: 80)
    #[arg(short, long, default_value = "80")]
    port: u16,

    /// Only print the transfer server status and exit
    #[arg(long)]
    status: bool,
}

/// Request body that advances the progress bar as reqwest pulls from it
struct ProgressReader {
    inner: Cursor<Vec<u8>>,
    bar: ProgressBar,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        Ok(n)
    }
}

fn explain_status(status: u16) -> &'static str {
    match status {
        400 => "Request rejected: size or digest header missing or malformed",
        409 => "Another upload is already in progress",
        413 => "Image is empty or larger than the update partition",
        422 => "SHA-256 mismatch; the image was corrupted in transit and discarded",
        500 => "Console could not write the update partition",
        503 => "Console is not accepting uploads. Provision Wi-Fi from the app first",
        _ => "Unexpected response",
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", "❌".red(), message);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    let base = format!("http://{}:{}", cli.ip, cli.port);

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| fail(format!("HTTP client: {}", e)));

    // Check device is reachable and ready
    print!("{}Checking console...", "   ".dimmed());
    let snapshot = match client.get(format!("{}/api/ota/status", base)).send() {
        Ok(resp) if resp.status().is_success() => resp
            .json::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null),
        _ => {
            println!("\r{} Console not reachable", "❌".red());
            std::process::exit(1);
        }
    };
    println!("\r{}Console online ✓    ", "   ".dimmed());

    if cli.status {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| snapshot.to_string())
        );
        return;
    }
    if snapshot.get("accepting") == Some(&serde_json::Value::Bool(false)) {
        fail(explain_status(503));
    }

    // Default firmware path
    let firmware_path = cli.firmware.unwrap_or_else(|| {
        PathBuf::from("target/xtensa-esp32s3-espidf/release/driver-console")
    });

    if !firmware_path.exists() {
        eprintln!("{} Firmware not found: {}", "❌".red(), firmware_path.display());
        eprintln!("   Build the firmware with cargo build --release first");
        std::process::exit(1);
    }

    let firmware_data = match fs::read(&firmware_path) {
        Ok(data) => data,
        Err(e) => fail(format!("Failed to read firmware: {}", e)),
    };

    let file_size = firmware_data.len();
    let digest = to_hex(&sha256(&firmware_data));
    println!("{} Driver console OTA update", "🚀".blue());
    println!("{}Console: {}:{}", "   ".dimmed(), cli.ip, cli.port);
    println!(
        "{}Firmware: {} bytes ({:.2} MB)",
        "   ".dimmed(),
        file_size,
        file_size as f64 / 1024.0 / 1024.0
    );
    println!("{}SHA-256: {}", "   ".dimmed(), digest);

    let pb = ProgressBar::new(file_size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let body = reqwest::blocking::Body::sized(
        ProgressReader {
            inner: Cursor::new(firmware_data),
            bar: pb.clone(),
        },
        file_size as u64,
    );

    // Flash writes are slow; allow for a large image over a weak link
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|e| fail(format!("HTTP client: {}", e)));

    match client
        .post(format!("{}/ota/update", base))
        .header(SIZE_HEADER, file_size.to_string())
        .header(DIGEST_HEADER, digest)
        .body(body)
        .send()
    {
        Ok(response) => {
            pb.finish_and_clear();
            let status = response.status();
            if status.is_success() {
                println!("{} Upload verified! Console will restart.", "✅".green());
                println!(
                    "{}The new firmware runs its self-test on first boot and rolls back if it fails.",
                    "   ".dimmed()
                );
            } else {
                eprintln!("{} Upload failed: HTTP {}", "❌".red(), status);
                eprintln!("   {}", explain_status(status.as_u16()));
                if let Ok(text) = response.text() {
                    if !text.is_empty() {
                        eprintln!("   Console said: {}", text.trim());
                    }
                }
                std::process::exit(1);
            }
        }
        Err(e) => {
            pb.finish_and_clear();
            fail(format!("Error: {}", e));
        }
    }
}
