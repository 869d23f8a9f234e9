use anyhow::{Context, Result};
use clap::Parser;
use minerwatch_rs::adapters::AdapterSet;
use minerwatch_rs::config::{Args, Command, Config};
use minerwatch_rs::device::{Credentials, InMemoryRegistry};
use minerwatch_rs::discovery::DiscoveryScanner;
use minerwatch_rs::logging::init_logging;
use minerwatch_rs::monitoring::{MonitorEvent, PollScheduler};
use minerwatch_rs::telemetry::sink::LoggingSink;
use minerwatch_rs::{DetectionOutcome, DeviceDetector};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置，文件不存在时使用默认值
    let config_exists = Path::new(&args.config).exists();
    let config = if config_exists {
        match Config::load(&args.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load config: {:#}", e);
                return;
            }
        }
    } else {
        Config::default()
    };

    // 初始化日志系统
    let _log_guard = match init_logging(config.log_config(&args)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return;
        }
    };

    info!("🚀 Starting MinerWatch-RS v{}", minerwatch_rs::VERSION);
    if config_exists {
        info!("📋 Configuration loaded from: {}", args.config);
    } else {
        warn!("Config file {} not found, using defaults", args.config);
    }

    let command = args.command.clone().unwrap_or(Command::Watch);
    let result = match command {
        Command::Watch => watch(config).await,
        Command::Scan { addresses } => scan(config, addresses).await,
        Command::Detect { address, username, password } => {
            let credentials = username.map(|u| Credentials::new(u, password.unwrap_or_default()));
            detect(config, &address, credentials).await
        }
    };

    if let Err(e) = result {
        error!("❌ {:#}", e);
    }
}

/// 轮询配置中的全部设备，直到 Ctrl-C
async fn watch(config: Config) -> Result<()> {
    let devices = config.devices();
    if devices.is_empty() {
        anyhow::bail!("No [[devices]] configured; run `minerwatch scan` to find some");
    }

    let registry = Arc::new(InMemoryRegistry::with_devices(devices.clone()));
    let scheduler = PollScheduler::new(
        registry,
        Arc::new(LoggingSink),
        AdapterSet::from_config(&config.adapters),
        config.poller.clone(),
    );

    let mut events = scheduler.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MonitorEvent::StatusChanged { device_id, online, .. } => {
                    info!(
                        target: "device",
                        device_id,
                        "Status changed: {}",
                        minerwatch_rs::logging::formatter::format_status(online)
                    );
                }
                MonitorEvent::NewRecord { device_id, difficulty, .. } => {
                    info!(
                        target: "device",
                        device_id,
                        "🏆 Best difficulty record {}",
                        minerwatch_rs::utils::format_difficulty(difficulty)
                    );
                }
                MonitorEvent::Snapshot { .. } => {}
            }
        }
    });

    for device in &devices {
        scheduler.start_polling(device).await;
    }
    info!("✅ Polling {} devices", devices.len());

    tokio::signal::ctrl_c()
        .await
        .context("Error waiting for signal")?;
    info!("🛑 Received shutdown signal");

    scheduler.stop_all().await;
    event_logger.abort();
    info!("👋 Monitoring stopped");
    Ok(())
}

/// 扫描网段并以 JSON 输出候选设备
async fn scan(config: Config, addresses: Vec<String>) -> Result<()> {
    let scanner = Arc::new(DiscoveryScanner::from_config(&config.adapters, &config.discovery));

    let canceller = {
        let scanner = scanner.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                scanner.cancel();
            }
        })
    };

    let on_progress = |p: minerwatch_rs::discovery::DiscoveryProgress| {
        info!(
            target: "discovery",
            "Scanned {}/{} addresses, {} found{}",
            p.scanned,
            p.total,
            p.found,
            if p.cancelled { " (cancelled)" } else { "" }
        );
    };

    let found = if addresses.is_empty() {
        scanner.discover_devices(on_progress).await?
    } else {
        scanner.scan_addresses(addresses, on_progress).await?
    };
    canceller.abort();

    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

/// 识别单个地址
async fn detect(config: Config, address: &str, credentials: Option<Credentials>) -> Result<()> {
    let detector = DeviceDetector::new(AdapterSet::from_config(&config.adapters));
    let outcome = detector.detect(address, credentials.as_ref()).await;

    let report = match &outcome {
        DetectionOutcome::Detected { device_type, snapshot } => json!({
            "address": address,
            "status": "detected",
            "type": device_type,
            "snapshot": snapshot,
        }),
        DetectionOutcome::NeedsCredentials { device_type } => json!({
            "address": address,
            "status": "needs-credentials",
            "type": device_type,
        }),
        DetectionOutcome::NotFound => json!({
            "address": address,
            "status": "not-found",
        }),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
