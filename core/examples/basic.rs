//! Guarding a flaky quote vendor behind a rate limit and a circuit breaker
//!
//! Run with `RUST_LOG=market_guard=debug cargo run --example basic` to see
//! transitions and rejections logged.

use market_guard::{
    CircuitBreakerRegistry, Config, Gate, GuardError, RateLimitConfig, RateLimiterRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "market_guard=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== market-guard basic example ===\n");

    let breakers = CircuitBreakerRegistry::new(Config {
        failure_threshold: 3,
        recovery_timeout_secs: 1.0,
        half_open_max_calls: 2,
        ..Default::default()
    });
    let limiters = RateLimiterRegistry::new(RateLimitConfig {
        max_requests: 20,
        window_secs: 60.0,
    });
    let gate = Gate::new(Arc::new(limiters), Arc::new(breakers));

    println!("--- Vendor failing ---");
    for i in 1..=5 {
        let outcome = gate.execute("10.0.0.1", "quote_vendor", move || {
            Err::<f64, _>(format!("vendor timeout #{i}"))
        });
        report(outcome);
    }

    println!("\n--- Waiting for recovery timeout ---");
    std::thread::sleep(Duration::from_millis(1100));

    for _ in 0..2 {
        report(gate.execute("10.0.0.1", "quote_vendor", || Ok::<_, String>(71_200.0)));
    }

    println!("\n--- Burst from one client ---");
    for _ in 0..20 {
        let _ = gate.execute("10.0.0.2", "quote_vendor", || Ok::<_, String>(0.0));
    }
    report(gate.execute("10.0.0.2", "quote_vendor", || Ok::<_, String>(0.0)));

    println!("\n--- Circuit stats ---");
    for stats in gate.breakers().all_stats() {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("stats unavailable: {e}"),
        }
    }
}

fn report(outcome: Result<f64, GuardError<String>>) {
    match outcome {
        Ok(price) => println!("ok      {price}"),
        Err(e) => match e.status_code() {
            Some(status) => println!("{status}     {e}"),
            None => println!("failed  {e}"),
        },
    }
}
