use crate::admission::SeaOrmOrderRepository;
use crate::cli::StockArgs;
use crate::coordinator::Coordinator;
use anyhow::{Context, Result};

pub async fn execute(coordinator: &Coordinator, args: &StockArgs) -> Result<()> {
    let admission = coordinator.admission();
    admission
        .load_stock(args.voucher_id, args.stock)
        .await
        .with_context(|| format!("Failed to load stock for voucher {}", args.voucher_id))?;
    println!(
        "✅ Loaded stock {} for voucher {} into {}",
        args.stock,
        args.voucher_id,
        admission.keys(args.voucher_id).stock_key
    );

    if args.database {
        let repository = SeaOrmOrderRepository::connect(&coordinator.config().database).await?;
        repository.init_schema().await?;
        repository
            .upsert_voucher_stock(args.voucher_id, args.stock)
            .await?;
        println!("✅ Database stock updated for voucher {}", args.voucher_id);
    }

    Ok(())
}
