use crate::cli::PendingArgs;
use crate::coordinator::Coordinator;
use anyhow::{Context, Result};

pub async fn execute(coordinator: &Coordinator, args: &PendingArgs) -> Result<()> {
    let admission = coordinator.admission();
    if args.init {
        admission.init().await.context("Failed to create consumer group")?;
    }

    let config = admission.config();
    let pending = admission
        .pending_count()
        .await
        .with_context(|| format!("Consumer group '{}' not readable", config.group))?;

    println!("=== Pending Orders ===\n");
    println!("Stream:  {}", config.stream_key);
    println!("Group:   {}", config.group);
    println!("Pending: {}", pending);
    if pending > 0 {
        println!("\n⚠️ {} order message(s) await replay by the consumer", pending);
    }
    Ok(())
}
