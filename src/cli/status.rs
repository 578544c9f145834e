use crate::cli::StatusArgs;
use crate::coordinator::Coordinator;
use anyhow::Result;

pub async fn execute(coordinator: &Coordinator, args: &StatusArgs) -> Result<()> {
    if args.prometheus {
        print!("{}", coordinator.metrics().render_prometheus());
        return Ok(());
    }

    let config = coordinator.config();
    println!("=== oxflash Status ===\n");

    match coordinator.store().ping().await {
        Ok(()) => println!("Store:    ✅ REACHABLE ({:?})", config.store.mode),
        Err(e) => {
            println!("Store:    ❌ UNREACHABLE ({})", e);
            return Ok(());
        }
    }

    let pending = coordinator
        .admission()
        .pending_count()
        .await
        .map(|n| n.to_string())
        .unwrap_or_else(|e| format!("unavailable ({})", e));
    println!(
        "Stream:   {} (group {}, consumer {})",
        config.admission.stream_key, config.admission.group, config.admission.consumer
    );
    println!("Pending:  {}", pending);

    if args.verbose {
        println!("\nLock prefix:     {}", config.lock.key_prefix);
        println!("Counter prefix:  {}", config.id.counter_prefix);
        println!(
            "Cache TTL:       {}s (null marker {}s)",
            config.cache.default_ttl, config.cache.null_ttl
        );
        println!("Rebuild workers: {}", config.cache.rebuild_workers);
        println!("Instance:        {}", coordinator.lock().instance_id());
        let metrics = coordinator.metrics().render_prometheus();
        if !metrics.is_empty() {
            println!("\n{}", metrics.trim_end());
        }
    }

    Ok(())
}
