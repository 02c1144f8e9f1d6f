use std::process;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use handoff::{Coordinator, CoordinatorConfig, SyncPolicy};

/// Initialize tracing with HANDOFF_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("HANDOFF_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("handoff={level},handoff::bridge::codec=warn"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoMode {
    Scalar,
    Collection,
    Shared,
    Transfer,
    All,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (mode, values) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: handoff-demo [scalar|collection|shared|transfer|all] [<number>...]");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  HANDOFF_SYNC   unsynchronized|locked [default: unsynchronized]");
            eprintln!("  HANDOFF_LOG    trace|debug|info|warn|error [default: info]");
            eprintln!("  LOG_FORMAT     set to 'json' for JSON log lines");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(mode, values) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(DemoMode, Vec<f64>), String> {
    let mut mode = DemoMode::All;
    let mut values = Vec::new();

    for (i, arg) in args.iter().enumerate().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Err(String::new()),
            "scalar" if i == 1 => mode = DemoMode::Scalar,
            "collection" if i == 1 => mode = DemoMode::Collection,
            "shared" if i == 1 => mode = DemoMode::Shared,
            "transfer" if i == 1 => mode = DemoMode::Transfer,
            "all" if i == 1 => mode = DemoMode::All,
            other => {
                let value: f64 = other
                    .parse()
                    .map_err(|_| format!("not a number: {other}"))?;
                if !value.is_finite() {
                    return Err(format!("not a finite number: {other}"));
                }
                values.push(value);
            }
        }
    }

    if mode == DemoMode::Scalar && values.len() > 1 {
        return Err("scalar mode takes a single number".to_string());
    }
    Ok((mode, values))
}

fn sync_policy_from_env() -> anyhow::Result<SyncPolicy> {
    match std::env::var("HANDOFF_SYNC") {
        Ok(value) => value
            .parse()
            .map_err(anyhow::Error::msg)
            .context("invalid HANDOFF_SYNC"),
        Err(_) => Ok(SyncPolicy::default()),
    }
}

fn run(mode: DemoMode, values: Vec<f64>) -> anyhow::Result<()> {
    let config = CoordinatorConfig::new().with_sync_policy(sync_policy_from_env()?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let (coordinator, worker) = Coordinator::spawn(config);
        let pick = |default: &[f64]| {
            if values.is_empty() {
                default.to_vec()
            } else {
                values.clone()
            }
        };

        if matches!(mode, DemoMode::Scalar | DemoMode::All) {
            let x = pick(&[1.0])[0];
            let result = coordinator.compute_scalar(x).await?;
            println!("scalar:     {x} -> {result}");
        }
        if matches!(mode, DemoMode::Collection | DemoMode::All) {
            let xs = pick(&[2.0, 3.0, 4.0]);
            let result = coordinator.compute_collection(&xs).await?;
            println!("collection: {} -> {}", join(&xs), join(&result));
        }
        if matches!(mode, DemoMode::Shared | DemoMode::All) {
            let xs = pick(&[5.0, 6.0, 7.0]);
            let region = coordinator.compute_shared(&xs).await?;
            println!("shared:     {} -> {}", join(&xs), join(&region.snapshot()));
        }
        if matches!(mode, DemoMode::Transfer | DemoMode::All) {
            let xs = pick(&[8.0, 9.0, 10.0]);
            let result = coordinator.compute_transfer(&xs).await?;
            println!("transfer:   {} -> {}", join(&xs), join(&result));
        }

        drop(coordinator);
        let stats = worker.join().await?;
        tracing::debug!(handled = stats.handled, rejected = stats.rejected, "Demo finished");
        Ok::<(), anyhow::Error>(())
    })
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
