//! `spindle info` — Display build and platform info.

use spindle_core::hazard::{RECLAIM_THRESHOLD, SLOTS_PER_RECORD};
use spindle_core::PoolConfig;

pub fn execute() -> anyhow::Result<()> {
    println!("Spindle v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Platform:     {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    println!("CPUs:         {}", num_cpus::get());
    println!("Physical:     {}", num_cpus::get_physical());

    let defaults = PoolConfig::default();
    defaults.validate()?;

    println!();
    println!("Pool defaults:");
    println!("  workers:      {}", defaults.worker_count);
    println!("  local order:  {:?}", defaults.local_order);
    println!("  thread name:  {}-<id>", defaults.thread_name_prefix);
    println!("  idle sleep:   {:?}", defaults.idle_sleep);
    println!("  on drop:      {:?}", defaults.shutdown_on_drop);

    println!();
    println!("Hazard pointers:");
    println!("  slots/thread: {}", SLOTS_PER_RECORD);
    println!("  scan every:   {} retirements", RECLAIM_THRESHOLD);

    println!();
    println!("Environment:");
    match std::env::var("RUST_LOG") {
        Ok(value) => println!("  RUST_LOG = {}", value),
        Err(_) => println!("  RUST_LOG (not set, using info)"),
    }

    Ok(())
}
