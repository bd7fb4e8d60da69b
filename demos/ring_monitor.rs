use futures::StreamExt;
use std::sync::Arc;
use tracing::{error, info, warn};
use ringlink::{
    BtleplugTransport, MeasurementEvent, MeasurementKind, Result, ScanParams, SessionConfig,
    Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💍 Ringlink Monitor Example");
    info!("Searching for rings...");

    let transport = Arc::new(BtleplugTransport::new().await?);
    let supervisor = Supervisor::new(transport, SessionConfig::default());

    let device = match supervisor.find_first(&ScanParams::default()).await {
        Ok(device) => device,
        Err(e) => {
            error!("❌ No ring found: {}", e);
            return Err(e);
        }
    };
    info!("📡 Found: {}", device);

    let session = supervisor.connect(device)?;
    let mut transitions = session.transitions();
    tokio::spawn(async move {
        while let Ok(t) = transitions.recv().await {
            info!("🔄 {} -> {}", t.from, t.to);
        }
    });

    if let Err(e) = session.wait_established().await {
        error!("❌ Session failed: {}", e);
        return Err(e);
    }
    info!("✅ Session ready");

    // Run a heart rate measurement and follow its countdown
    let mut progress = session.measurement_progress(MeasurementKind::HeartRate);
    session.start_measurement(MeasurementKind::HeartRate).await?;
    while let Some(event) = progress.next().await {
        match event {
            MeasurementEvent::Progress {
                remaining, total, ..
            } => info!("⏱️  {}s / {}s", remaining.as_secs(), total.as_secs()),
            MeasurementEvent::Completed { kind } => info!("✅ {} measurement complete", kind),
            MeasurementEvent::Cancelled { kind, reason } => {
                warn!("⚠️ {} measurement cancelled: {}", kind, reason);
            }
        }
    }

    let snapshot = session.snapshot();
    println!("\n📊 Ring Snapshot");
    println!("  Battery:    {:?} %", snapshot.battery_percent);
    println!("  Heart rate: {:?} bpm", snapshot.heart_rate_bpm);
    println!("  Steps:      {:?}", snapshot.steps);
    println!("  Distance:   {:?} m", snapshot.distance_m);
    println!("  Calories:   {:?} kcal", snapshot.calories_kcal);
    println!("  Stress:     {:?}", snapshot.stress);

    let stats = session.decode_stats();
    info!(
        "📦 {} packets, {} readings, {} dropped",
        stats.packets,
        stats.decoded,
        stats.dropped()
    );

    info!("🔌 Disconnecting...");
    supervisor.disconnect().await?;
    info!("👋 Done");
    Ok(())
}
