use walletscan::{storage, wallet::ChainCursor};

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "./walletscan_data".to_string());
    println!("🔍 Inspecting wallet database at '{path}'...");

    let db = storage::open(&walletscan::config::Storage { path: path.clone(), chain_path: None })?;

    let stats = db.get_stats()?;
    println!("\n📊 Column families:");
    println!("   descriptor: {}", stats.descriptor_count);
    println!("   wallet_tx:  {}", stats.wallet_tx_count);
    println!("   block:      {}", stats.block_count);

    match db.get::<ChainCursor>("cursor", b"cursor") {
        Ok(Some(c)) => println!("\n📍 Cursor: height {} hash {}", c.height, c.hash),
        Ok(None) => println!("\n📍 Cursor: none (reconciliation required)"),
        Err(e) => println!("\n❌ Cursor undecodable: {e:#}"),
    }
    if let Ok(Some(start)) = db.get::<u64>("cursor", b"replay") {
        println!("   ⚠️  interrupted replay pending from height {start}");
    }

    println!("\n🗄️ Database Storage Info:");
    if let Ok(entries) = std::fs::read_dir(&path) {
        let mut sst_files = 0;
        let mut total_size = 0u64;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.extension().is_some_and(|ext| ext == "sst") {
                sst_files += 1;
            }
            if let Ok(meta) = entry.metadata() {
                total_size += meta.len();
            }
        }
        println!("   SST files: {sst_files}");
        println!("   Total size: {:.2} MB", total_size as f64 / 1_048_576.0);
    }

    db.close()?;
    Ok(())
}
