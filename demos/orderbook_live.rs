//! Live order-book demo - streams verified books from Kraken
//!
//! Usage:
//!   cargo run --example orderbook_live
//!
//! Optional:
//!   KRAKEN_SYMBOLS=BTC/USD,ETH/USD  # Symbols to follow (default: BTC/USD)
//!   KRAKEN_DEPTH=25                 # Book depth (default: 10)
//!   RUST_LOG=kraken_orderbook=debug # Log filter

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kraken_orderbook::{BookSnapshot, Config, OrderbookClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kraken_orderbook=info".parse()?),
        )
        .init();

    let symbols: Vec<String> = std::env::var("KRAKEN_SYMBOLS")
        .unwrap_or_else(|_| "BTC/USD".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let depth: u32 = match std::env::var("KRAKEN_DEPTH") {
        Ok(d) => d.parse()?,
        Err(_) => 10,
    };

    println!("=== Kraken Order Book Live ===\n");

    let client = OrderbookClient::connect(Config::new().with_depth(depth))?;

    let updates = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&updates);
    client.on_update(move |book| {
        // Print every 50th update to keep the output readable
        if counter.fetch_add(1, Ordering::Relaxed) % 50 == 0 {
            print_book_summary(book);
        }
    });
    client.on_resync(|symbol, reason| {
        println!("[RESYNC] {} | {}", symbol, reason);
    });
    client.on_error(|symbol, err| {
        println!("[ERROR] {} | {}", symbol, err);
    });

    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    println!("Subscribing to {:?} at depth {}...", refs, depth);
    client.subscribe(&refs, depth).await?;

    println!("=== Streaming Live Data ===");
    println!("(Press Ctrl+C to stop)\n");

    let start_time = std::time::Instant::now();
    let mut stats = tokio::time::interval(Duration::from_secs(10));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats.tick() => {
                let elapsed = start_time.elapsed().as_secs_f64();
                let count = updates.load(Ordering::Relaxed);
                println!(
                    "\n--- {} verified updates in {:.1}s ({:.1} upd/s), books: {:?} ---\n",
                    count,
                    elapsed,
                    count as f64 / elapsed,
                    client.symbols()
                );
            }
        }
    }

    println!("\nShutting down...");
    client.close().await;

    for symbol in &symbols {
        if let Some(book) = client.get_snapshot(symbol) {
            println!("Final state:");
            print_book_summary(&book);
        }
    }
    Ok(())
}

fn print_book_summary(book: &BookSnapshot) {
    let bid = book
        .best_bid()
        .map(|(p, q)| format!("{} x {}", p, q))
        .unwrap_or_else(|| "-".to_string());
    let ask = book
        .best_ask()
        .map(|(p, q)| format!("{} x {}", p, q))
        .unwrap_or_else(|| "-".to_string());
    let spread = book
        .spread()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!(
        "  {} | bid {} | ask {} | spread {} | levels {}/{} | crc {}",
        book.symbol,
        bid,
        ask,
        spread,
        book.bids.len(),
        book.asks.len(),
        book.checksum
    );
}
