//! Basic usage example for the watch scheduler

use std::sync::Arc;

use serde_json::json;
use timewatch::{Duration, MemoryStore, Options, TimeWatch, Watch};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let store = Arc::new(MemoryStore::new());

    // First life: register a few watches, then "crash" before they fire.
    {
        let scheduler = TimeWatch::new(store.clone(), Options::new("example_watch"))?;

        scheduler
            .register(Duration::from_secs(2), Watch::new("short_watch"), || {
                println!("watch 'short_watch' fired!")
            })
            .await?;
        scheduler
            .register(
                Duration::from_secs(30),
                Watch::with_attributes("order_timeout", json!({"order_id": 4711})),
                || println!("watch 'order_timeout' fired!"),
            )
            .await?;

        println!("Watches registered! Waiting for the short one...");
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Simulate an abnormal shutdown: the 30 s watch never fires here,
        // but its record stays behind in the store.
        scheduler.shutdown();
        println!("Simulated crash; 'order_timeout' is still outstanding.");
    }

    // Second life: recover the survivors.
    let scheduler = TimeWatch::new(store, Options::new("example_watch"))?;
    scheduler
        .recover(|watch| {
            println!(
                "recovered watch '{}' fired with payload {}",
                watch.field, watch.customized_attributes
            );
        })
        .await?;
    println!("Recovery done; 'order_timeout' is re-armed for its remaining delay.");

    // Demonstrate reset and stop on a fresh watch.
    let handle = scheduler
        .register(Duration::from_secs(10), Watch::new("cancelled_watch"), || {
            println!("this line is never printed")
        })
        .await?;
    handle.reset(Duration::from_secs(5)).await?;
    handle.stop().await?;
    println!("Watch cancelled!");

    // Shutdown gracefully
    scheduler.shutdown();
    println!("Scheduler shut down successfully!");
    Ok(())
}
