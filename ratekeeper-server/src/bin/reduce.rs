//! Issue one decision request against a running server.

use clap::Parser;
use ratekeeper::{ReduceRequest, ReduceResponse};

#[derive(Parser)]
#[command(name = "ratekeeper-reduce", about = "Consume one token from a ratekeeper bucket")]
struct Args {
    /// Server base URL
    #[arg(long, env = "RATEKEEPER_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bucket key, e.g. `sms:543`
    key: String,

    /// Bucket capacity
    #[arg(long)]
    max_amount: u32,

    /// Tokens added per interval (0 = refill to capacity)
    #[arg(long, default_value_t = 0)]
    refill_amount: u32,

    /// Refill interval in seconds
    #[arg(long)]
    refill_duration_sec: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let request =
        ReduceRequest::new(args.key, args.max_amount, args.refill_amount, args.refill_duration_sec);

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/reduce", args.url.trim_end_matches('/')))
        .json(&request)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        eprintln!("request failed ({}): {}", status, body);
        std::process::exit(1);
    }

    let decision: ReduceResponse = resp.json().await?;
    println!("{} remaining={}", decision.status, decision.remaining);
    Ok(())
}
