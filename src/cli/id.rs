use crate::cli::NextIdArgs;
use crate::coordinator::Coordinator;
use crate::id::IdGenerator;
use anyhow::Result;

pub async fn execute(coordinator: &Coordinator, args: &NextIdArgs) -> Result<()> {
    let ids = coordinator.ids();
    for _ in 0..args.count.max(1) {
        let id = ids.next_id(&args.prefix).await?;
        println!(
            "{}\t(ts={}, seq={})",
            id,
            ids.timestamp_of(id),
            IdGenerator::sequence_of(id)
        );
    }
    Ok(())
}
