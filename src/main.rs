mod args;

use adb_link::AdbConfig;
use adb_link::adb::discovery::{DiscoveryService, MdnsBackend};
use adb_link::adb::pairing::QrPairing;
use adb_link::adb::types::ServiceType;
use args::{Args, Mode};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DISCOVER_SECS: u64 = 10;

fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

#[tokio::main]
async fn main() {
    let Some(args) = Args::parse() else {
        return;
    };
    init_logging(args.debug_mode);

    match args.mode {
        Mode::Qr => {
            let qr = QrPairing::generate();
            println!("📱 Scan from Developer options > Wireless debugging > Pair device with QR code");
            match qr.render() {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => eprintln!("⚠️ Could not draw the QR code: {e}"),
            }
            println!("Instance: {}", qr.instance_name);
            println!("Code:     {}", qr.code);
            println!("{}", qr.payload());
        }
        Mode::Discover => {
            let secs = args.timeout_secs.unwrap_or(DEFAULT_DISCOVER_SECS);
            if let Err(e) = discover(Duration::from_secs(secs)).await {
                eprintln!("❌ Discovery failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn discover(duration: Duration) -> adb_link::AdbResult<()> {
    let config = AdbConfig::from_env();
    let backend = Arc::new(MdnsBackend::new()?);
    let services: Vec<Arc<DiscoveryService>> = ServiceType::ALL
        .iter()
        .map(|ty| Arc::new(DiscoveryService::new(*ty, backend.clone(), config.resolve_mode)))
        .collect();

    let mut printers = Vec::new();
    for service in &services {
        let mut records = service.subscribe();
        let ty = service.service_type();
        printers.push(tokio::spawn(async move {
            while records.changed().await.is_ok() {
                let snapshot = records.borrow_and_update().clone();
                println!("🔎 {ty}: {} service(s)", snapshot.len());
                for record in snapshot.iter() {
                    let addresses: Vec<String> =
                        record.addresses.iter().map(|a| a.to_string()).collect();
                    println!("    {} [{}] port {}", record.name, addresses.join(", "), record.port);
                }
            }
        }));
        service.start().await?;
    }

    log::info!("Browsing for {}s", duration.as_secs());
    tokio::time::sleep(duration).await;

    for service in &services {
        service.stop().await;
    }
    for printer in printers {
        printer.abort();
    }
    backend.shutdown();
    Ok(())
}
